// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `cordon start`: trigger an execution
//!
//! Without `--watch` this only registers the execution; a running daemon
//! sharing the same database picks it up. With `--watch` an in-process worker
//! pool drives it and the command exits once it reaches a terminal state.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use cordon_core::application::start_execution::{
    StartAgentExecutionUseCase, StartExecutionRequest, StartedExecution,
};
use cordon_core::domain::events::ExecutionEvent;
use cordon_core::domain::execution::{ExecutionId, ParentJobId, TenantId, UserId};
use cordon_core::domain::node_config::OrchestratorConfigManifest;
use cordon_core::infrastructure::event_bus::EventBusError;

use crate::embedded::EmbeddedOrchestrator;

#[derive(Subcommand, Debug, Clone)]
pub enum StartCommand {
    /// Run the workflow agent for one workflow run
    Workflow {
        #[command(flatten)]
        common: StartArgs,
    },

    /// Run the question answering agent for one question
    #[command(name = "qa")]
    QuestionAnswering {
        #[command(flatten)]
        common: StartArgs,

        /// Question to answer
        #[arg(long)]
        question: Uuid,
    },
}

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Parent job (workflow run or QA job) ID
    #[arg(long)]
    pub job: Uuid,

    /// Owning tenant
    #[arg(long, env = "CORDON_TENANT_ID")]
    pub tenant: Uuid,

    /// Requesting user
    #[arg(long, env = "CORDON_USER_ID")]
    pub user: Uuid,

    /// Task parameters as a JSON object
    #[arg(long, default_value = "{}")]
    pub params: String,

    /// Drive the execution in-process and follow it to completion
    #[arg(long)]
    pub watch: bool,
}

impl StartCommand {
    fn watch(&self) -> bool {
        match self {
            StartCommand::Workflow { common } | StartCommand::QuestionAnswering { common, .. } => common.watch,
        }
    }

    pub fn into_request(self) -> Result<StartExecutionRequest> {
        match self {
            StartCommand::Workflow { common } => {
                let params = parse_params(&common.params)?;
                Ok(StartExecutionRequest::workflow(
                    ParentJobId(common.job),
                    TenantId(common.tenant),
                    UserId(common.user),
                    params,
                ))
            }
            StartCommand::QuestionAnswering { common, question } => {
                let params = parse_params(&common.params)?;
                Ok(StartExecutionRequest::question_answering(
                    ParentJobId(common.job),
                    TenantId(common.tenant),
                    UserId(common.user),
                    question,
                    params,
                ))
            }
        }
    }
}

fn parse_params(raw: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(raw).context("--params is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("--params must be a JSON object");
    }
    Ok(value)
}

pub async fn run(command: StartCommand, config: OrchestratorConfigManifest) -> Result<()> {
    let watch = command.watch();
    let request = command.into_request()?;
    let tenant_id = request.tenant_id;
    let orchestrator = EmbeddedOrchestrator::new(config).await?;

    if !watch {
        if !orchestrator.repositories().persistent {
            warn!("No spec.database configured: this execution will not outlive the command (use --watch)");
        }
        let started = orchestrator.starter().start(request).await?;
        print_started(&started);
        return Ok(());
    }

    // subscribe before starting so no event is missed
    let mut events = orchestrator.event_bus().subscribe();
    let pool = orchestrator.worker_pool("cordon-cli")?;
    let started = orchestrator.starter().start(request).await?;
    print_started(&started);

    let shutdown = CancellationToken::new();
    let handles = pool.spawn(shutdown.clone());

    let outcome = follow(&mut events, started.execution_id).await;

    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    outcome?;

    let record = orchestrator
        .query()
        .get_execution(tenant_id, started.execution_id)
        .await?;
    if let Some(message) = record.error_message {
        anyhow::bail!("Execution {} failed: {}", record.id, message);
    }
    Ok(())
}

fn print_started(started: &StartedExecution) {
    println!(
        "{}",
        format!("✓ Execution started: {}", started.execution_id).green()
    );
    println!("  Kind: {}", started.kind);
    println!("  Status: {}", started.status);
}

async fn follow(
    events: &mut cordon_core::infrastructure::event_bus::EventReceiver,
    execution_id: ExecutionId,
) -> Result<()> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(EventBusError::Lagged(_)) => continue,
            Err(e) => return Err(e).context("Event stream ended before the execution finished"),
        };
        if event.execution_id() != execution_id {
            continue;
        }
        if let Some(line) = describe_event(&event) {
            println!("  {}", line);
        }
        if event.is_terminal() {
            return Ok(());
        }
    }
}

fn describe_event(event: &ExecutionEvent) -> Option<String> {
    let line = match event {
        ExecutionEvent::ExecutionRequested { .. } => return None,
        ExecutionEvent::ExecutionStarted { .. } => "running".to_string(),
        ExecutionEvent::CredentialIssued { service_account_id, .. } => {
            format!("credential issued ({})", service_account_id)
        }
        ExecutionEvent::WorkloadLaunched { backend, workload_name, .. } => {
            format!("launched {} on {}", workload_name, backend)
        }
        ExecutionEvent::WorkloadPolled { state, status_checks, elapsed_secs, .. } => {
            format!("check #{}: {:?} after {}s", status_checks, state, elapsed_secs)
        }
        ExecutionEvent::ResultsExtracted { output_count, output_size_bytes, .. } => {
            format!("{} outputs, {} bytes", output_count, output_size_bytes)
        }
        ExecutionEvent::StepRetryScheduled { step, attempt, error, .. } => {
            format!("{} failed (attempt {}), retrying: {}", step, attempt, error)
                .yellow()
                .to_string()
        }
        ExecutionEvent::CleanupCompleted { warnings, .. } if warnings.is_empty() => "cleaned up".to_string(),
        ExecutionEvent::CleanupCompleted { warnings, .. } => {
            format!("cleaned up with warnings: {}", warnings.join("; ")).yellow().to_string()
        }
        ExecutionEvent::ExecutionCompleted { output_size_bytes, .. } => {
            format!("✓ completed ({} bytes)", output_size_bytes).green().to_string()
        }
        ExecutionEvent::ExecutionFailed { category, reason, .. } => {
            format!("✗ failed [{}]: {}", category, reason).red().to_string()
        }
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: StartCommand,
    }

    fn parse(args: &[&str]) -> StartCommand {
        TestCli::try_parse_from(args).unwrap().command
    }

    #[test]
    fn test_qa_merges_question_into_params() {
        let question = Uuid::new_v4();
        let command = parse(&[
            "test",
            "qa",
            "--job",
            &Uuid::new_v4().to_string(),
            "--tenant",
            &Uuid::new_v4().to_string(),
            "--user",
            &Uuid::new_v4().to_string(),
            "--question",
            &question.to_string(),
            "--params",
            r#"{"lang":"en"}"#,
        ]);
        assert!(!command.watch());

        let request = command.into_request().unwrap();
        assert_eq!(request.parameters["question_id"], question.to_string());
        assert_eq!(request.parameters["lang"], "en");
    }

    #[test]
    fn test_params_must_be_an_object() {
        assert!(parse_params("[1, 2]").is_err());
        assert!(parse_params("not json").is_err());
        assert!(parse_params("{}").unwrap().is_object());
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `cordon status`: one execution record and its output files

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use cordon_core::application::execution_query::ExecutionDetails;
use cordon_core::domain::execution::{ExecutionId, ExecutionStatus, TenantId};
use cordon_core::domain::node_config::OrchestratorConfigManifest;

use crate::embedded::EmbeddedOrchestrator;

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Execution ID
    pub execution_id: String,

    /// Owning tenant
    #[arg(long, env = "CORDON_TENANT_ID")]
    pub tenant: String,

    /// Print the full record as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: StatusArgs, config: OrchestratorConfigManifest) -> Result<()> {
    let execution_id = ExecutionId::from_string(&args.execution_id).context("Invalid execution ID")?;
    let tenant_id = TenantId::from_string(&args.tenant).context("Invalid tenant ID")?;

    let orchestrator = EmbeddedOrchestrator::new(config).await?;
    let details = orchestrator.query().describe(tenant_id, execution_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&details)?);
    } else {
        print_details(&details);
    }
    Ok(())
}

fn colored_status(status: ExecutionStatus) -> colored::ColoredString {
    match status {
        ExecutionStatus::Pending => status.as_str().dimmed(),
        ExecutionStatus::Running => status.as_str().yellow(),
        ExecutionStatus::Completed => status.as_str().green(),
        ExecutionStatus::Failed => status.as_str().red(),
    }
}

fn print_details(details: &ExecutionDetails) {
    let record = &details.record;
    println!("{} {}", "Execution".bold(), record.id);
    println!("  Kind:       {}", record.kind);
    println!("  Parent job: {}", record.parent_job_id);
    println!("  Status:     {}", colored_status(record.status));
    if let Some(step) = details.current_step.filter(|_| !record.status.is_terminal()) {
        println!("  Step:       {}", step);
    }
    println!("  Created:    {}", record.created_at.to_rfc3339());
    if let Some(started) = record.started_at {
        println!("  Started:    {}", started.to_rfc3339());
    }
    if let Some(completed) = record.completed_at {
        println!("  Finished:   {}", completed.to_rfc3339());
    }
    if let Some(size) = record.output_size_bytes {
        println!("  Output:     {} bytes", size);
    }
    if let Some(message) = &record.error_message {
        let category = record
            .error_category
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!("  Error:      {} ({})", message.red(), category);
    }

    if !details.output_files.is_empty() {
        println!();
        println!("{}", "Output files:".bold());
        for file in &details.output_files {
            println!("  {:<40} {:>10} bytes  {}", file.name, file.size_bytes, file.storage_key.dimmed());
        }
    }

    if let Some(log) = &record.execution_log {
        println!();
        println!("{}", "Agent log (tail):".bold());
        println!("{}", log);
    }
}

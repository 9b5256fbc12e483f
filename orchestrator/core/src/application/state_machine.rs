// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Execution State Machine
//!
//! Advances one [`ExecutionCheckpoint`] by exactly one step per call. The
//! caller (the worker pool) owns persistence: it hands over a freshly claimed
//! checkpoint and writes back whatever this module leaves in it.
//!
//! Routing rules:
//!
//! - A retryable activity error re-arms the same step after a backoff until
//!   the retry policy is exhausted.
//! - A fatal error (or exhausted retries) in `Launch`, `Poll` or
//!   `ExtractResults` is captured as the outcome and routed through
//!   `Cleanup`; cleanup always runs before the terminal write.
//! - `Finalize` writes the record exactly once and is retried until it lands.
//!
//! Polling never parks a task: the checkpoint is re-armed with
//! `wake_at = now + poll_interval` and handed back.

use crate::application::activities::{ActivityError, ExecutionActivities, RetryPolicy};
use crate::application::result_oracle::ExtractionContext;
use crate::domain::checkpoint::{ExecutionCheckpoint, ExecutionOutcome, OrchestrationStep};
use crate::domain::clock::Clock;
use crate::domain::events::ExecutionEvent;
use crate::domain::execution::FailureCategory;
use crate::domain::launcher::WorkloadState;
use crate::domain::node_config::OrchestrationConfig;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct StateMachineSettings {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub retry: RetryPolicy,
}

impl StateMachineSettings {
    pub fn from_config(config: &OrchestrationConfig) -> Self {
        Self {
            poll_interval: Duration::seconds(config.poll_interval_secs as i64),
            max_wait: Duration::seconds(config.max_wait_secs as i64),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

impl Default for StateMachineSettings {
    fn default() -> Self {
        Self::from_config(&OrchestrationConfig::default())
    }
}

pub struct ExecutionStateMachine {
    activities: ExecutionActivities,
    settings: StateMachineSettings,
    clock: Arc<dyn Clock>,
}

impl ExecutionStateMachine {
    pub fn new(activities: ExecutionActivities, settings: StateMachineSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            activities,
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &StateMachineSettings {
        &self.settings
    }

    /// Run the checkpoint's current step and leave the next one in it
    pub async fn step(&self, checkpoint: &mut ExecutionCheckpoint) {
        let step = checkpoint.step;
        let execution_id = checkpoint.execution_id;
        debug!(execution_id = %execution_id, step = ?step, attempt = checkpoint.attempt, "Running orchestration step");
        metrics::counter!("cordon_orchestration_steps_total", "step" => step.as_str()).increment(1);

        let result = match step {
            OrchestrationStep::MarkRunning => self.mark_running(checkpoint).await,
            OrchestrationStep::Launch => self.launch(checkpoint).await,
            OrchestrationStep::Poll => self.poll(checkpoint).await,
            OrchestrationStep::ExtractResults => self.extract_results(checkpoint).await,
            OrchestrationStep::Cleanup => {
                self.cleanup(checkpoint).await;
                Ok(())
            }
            OrchestrationStep::Finalize => self.finalize(checkpoint).await,
            OrchestrationStep::Done => Ok(()),
        };

        if let Err(err) = result {
            self.handle_failure(checkpoint, step, err);
        }
    }

    fn handle_failure(&self, checkpoint: &mut ExecutionCheckpoint, step: OrchestrationStep, err: ActivityError) {
        let now = self.clock.now();
        let execution_id = checkpoint.execution_id;
        let failed_attempts = checkpoint.attempt + 1;

        if err.is_retryable() && (step == OrchestrationStep::Finalize || self.settings.retry.allows_retry(failed_attempts)) {
            let retry_at = now + self.settings.retry.backoff(failed_attempts);
            warn!(
                execution_id = %execution_id,
                step = ?step,
                attempt = failed_attempts,
                error = %err,
                "Step failed, retry scheduled"
            );
            self.activities.event_bus().publish(ExecutionEvent::StepRetryScheduled {
                execution_id,
                step,
                attempt: failed_attempts,
                error: err.to_string(),
                retry_at,
            });
            checkpoint.schedule_retry(retry_at, now);
            return;
        }

        let outcome = if err.is_retryable() {
            ActivityError::retryable(format!(
                "{} failed after {} attempts: {}",
                step, failed_attempts, err
            ))
            .into_outcome()
        } else {
            err.into_outcome()
        };

        match step {
            OrchestrationStep::Finalize => {
                // the record itself is unusable; nothing left to write
                error!(execution_id = %execution_id, "Finalize failed permanently: {:?}", outcome);
                checkpoint.advance(OrchestrationStep::Done, now, now);
            }
            s if s.requires_cleanup_on_failure() => {
                warn!(execution_id = %execution_id, step = ?s, "Execution failed: {:?}", outcome);
                checkpoint.fail_into_cleanup(outcome, now);
            }
            _ => {
                // nothing was provisioned yet
                warn!(execution_id = %execution_id, step = ?step, "Execution failed before launch: {:?}", outcome);
                if checkpoint.state.outcome.is_none() {
                    checkpoint.state.outcome = Some(outcome);
                }
                checkpoint.advance(OrchestrationStep::Finalize, now, now);
            }
        }
    }

    async fn mark_running(&self, checkpoint: &mut ExecutionCheckpoint) -> Result<(), ActivityError> {
        self.activities.mark_running(checkpoint.execution_id).await?;
        let now = self.clock.now();
        checkpoint.advance(OrchestrationStep::Launch, now, now);
        Ok(())
    }

    async fn launch(&self, checkpoint: &mut ExecutionCheckpoint) -> Result<(), ActivityError> {
        let execution_id = checkpoint.execution_id;
        let task = checkpoint.state.task.clone();

        let issued = self
            .activities
            .provision_credential(
                execution_id,
                task.tenant_id,
                checkpoint.state.service_account_id,
                checkpoint.lease_owner.as_deref(),
            )
            .await?;
        // recorded before launching so cleanup can always revoke it
        checkpoint.state.service_account_id = Some(issued.service_account_id);

        let handle = self.activities.launch(execution_id, &task, &issued).await?;
        info!(execution_id = %execution_id, workload = %handle.name, "Workload launched");
        checkpoint.state.handle = Some(handle);

        let now = self.clock.now();
        checkpoint.advance(OrchestrationStep::Poll, now + self.settings.poll_interval, now);
        Ok(())
    }

    async fn poll(&self, checkpoint: &mut ExecutionCheckpoint) -> Result<(), ActivityError> {
        let execution_id = checkpoint.execution_id;
        let handle = checkpoint.state.handle.clone().ok_or_else(|| {
            ActivityError::fatal(FailureCategory::Internal, "poll scheduled without a launched workload")
        })?;

        let status = self.activities.check_status(&handle).await?;
        let now = self.clock.now();

        let poll = &mut checkpoint.state.poll;
        poll.elapsed_secs += self.settings.poll_interval.num_seconds().max(0) as u64;
        poll.status_checks += 1;
        if status.exit_code.is_some() {
            poll.last_exit_code = status.exit_code;
        }
        let elapsed_secs = poll.elapsed_secs;
        let status_checks = poll.status_checks;

        self.activities.event_bus().publish(ExecutionEvent::WorkloadPolled {
            execution_id,
            state: status.state,
            status_checks,
            elapsed_secs,
            polled_at: now,
        });

        match status.state {
            WorkloadState::Completed => {
                info!(execution_id = %execution_id, status_checks, "Workload completed");
                checkpoint.advance(OrchestrationStep::ExtractResults, now, now);
                Ok(())
            }
            WorkloadState::Failed => {
                let exit = status
                    .exit_code
                    .map(|c| format!("exit code {}", c))
                    .unwrap_or_else(|| "no exit code".to_string());
                let reason = status.reason.unwrap_or_else(|| "workload failed".to_string());
                Err(ActivityError::fatal(
                    FailureCategory::ExecutionFailed,
                    format!("{} ({})", reason, exit),
                ))
            }
            WorkloadState::Running if elapsed_secs as i64 >= self.settings.max_wait.num_seconds() => {
                Err(ActivityError::fatal(
                    FailureCategory::ExecutionTimeout,
                    format!(
                        "workload still running after {}s (budget {}s)",
                        elapsed_secs,
                        self.settings.max_wait.num_seconds()
                    ),
                ))
            }
            WorkloadState::Running => {
                checkpoint.advance(OrchestrationStep::Poll, now + self.settings.poll_interval, now);
                Ok(())
            }
        }
    }

    async fn extract_results(&self, checkpoint: &mut ExecutionCheckpoint) -> Result<(), ActivityError> {
        let ctx = ExtractionContext {
            execution_id: checkpoint.execution_id,
            task: &checkpoint.state.task,
            exit_code: checkpoint.state.poll.last_exit_code,
        };
        let result = self.activities.extract_results(&ctx).await?;

        checkpoint.state.outcome = Some(ExecutionOutcome::Succeeded {
            summary: result.summary,
            output_size_bytes: result.output_size_bytes,
        });
        let now = self.clock.now();
        checkpoint.advance(OrchestrationStep::Cleanup, now, now);
        Ok(())
    }

    async fn cleanup(&self, checkpoint: &mut ExecutionCheckpoint) {
        let warnings = self
            .activities
            .cleanup(
                checkpoint.execution_id,
                checkpoint.state.task.tenant_id,
                checkpoint.state.handle.as_ref(),
                checkpoint.state.service_account_id,
            )
            .await;
        checkpoint.state.cleanup_warnings.extend(warnings);

        let now = self.clock.now();
        checkpoint.advance(OrchestrationStep::Finalize, now, now);
    }

    async fn finalize(&self, checkpoint: &mut ExecutionCheckpoint) -> Result<(), ActivityError> {
        let outcome = checkpoint.state.outcome.clone().unwrap_or_else(|| {
            ExecutionOutcome::failed(FailureCategory::Internal, "execution finished without an outcome")
        });

        let written = self
            .activities
            .finalize(
                checkpoint.execution_id,
                &outcome,
                &checkpoint.state.poll,
                &checkpoint.state.cleanup_warnings,
            )
            .await?;
        if !written {
            debug!(execution_id = %checkpoint.execution_id, "Record already terminal, finalize skipped");
        }

        let now = self.clock.now();
        checkpoint.advance(OrchestrationStep::Done, now, now);
        Ok(())
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Execution Activities
//!
//! The side-effecting units of work the state machine schedules: record
//! transitions, credential issuance, launching, status reads, result
//! extraction, teardown and the terminal write. Each activity is safe to run
//! again after a crash; the state machine decides what happens on failure.
//!
//! # DDD Pattern: Application Service
//!
//! - **Layer:** Application
//! - **Responsibility:** Side effects behind each orchestration step
//! - **Collaborators:**
//!   - Domain: ExecutionRecord, WorkloadLauncher, CredentialIssuer
//!   - Application: JobSpecBuilder, ResultOracles
//!   - Infrastructure: ExecutionRepository, CheckpointRepository, EventBus

use crate::application::job_spec::JobSpecBuilder;
use crate::application::result_oracle::{ExtractedResult, ExtractionContext, ResultOracles};
use crate::domain::checkpoint::{ExecutionOutcome, ExecutionTask, OrchestrationStep, PollProgress};
use crate::domain::clock::Clock;
use crate::domain::events::ExecutionEvent;
use crate::domain::execution::{ExecutionId, ExecutionRecord, FailureCategory, TenantId};
use crate::domain::launcher::{
    workload_name, CleanupError, ExecutionHandle, LaunchError, WorkloadLauncher, WorkloadStatus,
};
use crate::domain::node_config::RetryConfig;
use crate::domain::repository::{CheckpointRepository, ExecutionRepository, RepositoryError};
use crate::domain::service_account::{CredentialError, CredentialIssuer, IssuedCredential, ServiceAccountId};
use crate::domain::storage::StorageError;
use crate::infrastructure::event_bus::EventBus;
use chrono::Duration;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Failure of one activity invocation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActivityError {
    /// Transient; the step is re-run according to the retry policy
    #[error("{0}")]
    Retryable(String),

    /// Permanent; the execution fails with `category`
    #[error("{message}")]
    Fatal {
        category: FailureCategory,
        message: String,
    },
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        ActivityError::Retryable(message.into())
    }

    pub fn fatal(category: FailureCategory, message: impl Into<String>) -> Self {
        ActivityError::Fatal {
            category,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivityError::Retryable(_))
    }

    /// Outcome recorded when this error ends the execution
    pub fn into_outcome(self) -> ExecutionOutcome {
        match self {
            ActivityError::Retryable(message) => ExecutionOutcome::failed(FailureCategory::Internal, message),
            ActivityError::Fatal { category, message } => ExecutionOutcome::failed(category, message),
        }
    }
}

impl From<LaunchError> for ActivityError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::Rejected(_) => ActivityError::fatal(FailureCategory::LaunchError, err.to_string()),
            LaunchError::Unavailable(_) => ActivityError::retryable(err.to_string()),
            LaunchError::BackendMismatch { .. } => ActivityError::fatal(FailureCategory::Internal, err.to_string()),
        }
    }
}

impl From<RepositoryError> for ActivityError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Serialization(_) => ActivityError::fatal(FailureCategory::Internal, err.to_string()),
            _ => ActivityError::retryable(err.to_string()),
        }
    }
}

impl From<StorageError> for ActivityError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidKey(_) | StorageError::PermissionDenied(_) => {
                ActivityError::fatal(FailureCategory::Internal, err.to_string())
            }
            _ => ActivityError::retryable(err.to_string()),
        }
    }
}

impl From<CredentialError> for ActivityError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Repository(_) | CredentialError::AlreadyIssued(_) => {
                ActivityError::retryable(err.to_string())
            }
            CredentialError::TenantMismatch { .. } | CredentialError::Generation(_) => {
                ActivityError::fatal(FailureCategory::Internal, err.to_string())
            }
        }
    }
}

/// Activity retry policy: bounded attempts with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::milliseconds(config.initial_backoff_ms as i64),
            max_backoff: Duration::milliseconds(config.max_backoff_ms as i64),
            multiplier: config.backoff_multiplier,
        }
    }

    /// Whether a step that has already failed `failed_attempts` times may run again
    pub fn allows_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }

    /// Delay before the retry following the `failed_attempts`-th failure (1-based)
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(30) as i32;
        let millis = self.initial_backoff.num_milliseconds() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.num_milliseconds() as f64);
        Duration::milliseconds(capped as i64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Shared collaborators of every activity
pub struct ExecutionActivities {
    executions: Arc<dyn ExecutionRepository>,
    checkpoints: Arc<dyn CheckpointRepository>,
    issuer: Arc<dyn CredentialIssuer>,
    launcher: Arc<dyn WorkloadLauncher>,
    job_specs: JobSpecBuilder,
    oracles: ResultOracles,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl ExecutionActivities {
    pub fn new(
        executions: Arc<dyn ExecutionRepository>,
        checkpoints: Arc<dyn CheckpointRepository>,
        issuer: Arc<dyn CredentialIssuer>,
        launcher: Arc<dyn WorkloadLauncher>,
        job_specs: JobSpecBuilder,
        oracles: ResultOracles,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executions,
            checkpoints,
            issuer,
            launcher,
            job_specs,
            oracles,
            event_bus,
            clock,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    async fn load_record(&self, execution_id: ExecutionId) -> Result<ExecutionRecord, ActivityError> {
        self.executions
            .find_by_id(execution_id)
            .await?
            .ok_or_else(|| {
                ActivityError::fatal(
                    FailureCategory::Internal,
                    format!("execution record {} not found", execution_id),
                )
            })
    }

    /// `pending -> running`, before any external call
    pub async fn mark_running(&self, execution_id: ExecutionId) -> Result<(), ActivityError> {
        let mut record = self.load_record(execution_id).await?;
        let now = self.clock.now();
        let changed = record
            .mark_running(now)
            .map_err(|e| ActivityError::fatal(FailureCategory::Internal, e.to_string()))?;

        if changed {
            self.executions.save(&record).await?;
            self.event_bus.publish(ExecutionEvent::ExecutionStarted {
                execution_id,
                started_at: now,
            });
        }
        Ok(())
    }

    /// Issue the workload credential, revoking any earlier one first.
    ///
    /// An active credential nobody recorded is only revoked while
    /// `lease_owner` still holds the Launch lease; otherwise it belongs to the
    /// worker that took over and the step fails retryably instead.
    pub async fn provision_credential(
        &self,
        execution_id: ExecutionId,
        tenant_id: TenantId,
        previous: Option<ServiceAccountId>,
        lease_owner: Option<&str>,
    ) -> Result<IssuedCredential, ActivityError> {
        if let Some(stale) = previous {
            info!(execution_id = %execution_id, service_account_id = %stale, "Revoking credential from an earlier launch attempt");
            self.issuer.revoke(stale, tenant_id).await?;
        }

        let issued = match self.issuer.create(execution_id, tenant_id).await {
            Ok(issued) => issued,
            Err(CredentialError::AlreadyIssued(_)) => {
                if !self.holds_launch_lease(execution_id, lease_owner).await? {
                    warn!(execution_id = %execution_id, owner = ?lease_owner, "Launch lease lost, leaving active credential alone");
                    return Err(ActivityError::retryable(format!(
                        "launch lease on {} is no longer held by {}",
                        execution_id,
                        lease_owner.unwrap_or("this worker")
                    )));
                }
                // minted by an attempt that crashed before its checkpoint landed
                if let Some(orphan) = self.issuer.active_for_execution(execution_id).await? {
                    warn!(execution_id = %execution_id, service_account_id = %orphan, "Revoking orphaned credential");
                    self.issuer.revoke(orphan, tenant_id).await?;
                }
                self.issuer.create(execution_id, tenant_id).await?
            }
            Err(e) => return Err(e.into()),
        };

        self.event_bus.publish(ExecutionEvent::CredentialIssued {
            execution_id,
            service_account_id: issued.service_account_id,
            issued_at: self.clock.now(),
        });
        Ok(issued)
    }

    async fn holds_launch_lease(
        &self,
        execution_id: ExecutionId,
        lease_owner: Option<&str>,
    ) -> Result<bool, ActivityError> {
        let Some(owner) = lease_owner else {
            return Ok(false);
        };
        let now = self.clock.now();
        Ok(matches!(
            self.checkpoints.find_by_id(execution_id).await?,
            Some(stored) if stored.step == OrchestrationStep::Launch
                && stored.lease_owner.as_deref() == Some(owner)
                && stored.is_leased(now)
        ))
    }

    pub async fn launch(
        &self,
        execution_id: ExecutionId,
        task: &ExecutionTask,
        credential: &IssuedCredential,
    ) -> Result<ExecutionHandle, ActivityError> {
        let spec = self
            .job_specs
            .build(execution_id, task, &credential.credential)
            .await?;

        info!(execution_id = %execution_id, backend = %self.launcher.backend(), image = %spec.image_reference(), "Launching workload");
        let handle = self
            .launcher
            .launch(spec)
            .await?
            .with_service_account(credential.service_account_id);

        self.event_bus.publish(ExecutionEvent::WorkloadLaunched {
            execution_id,
            backend: handle.backend,
            workload_name: handle.name.clone(),
            launched_at: self.clock.now(),
        });
        Ok(handle)
    }

    pub async fn check_status(&self, handle: &ExecutionHandle) -> Result<WorkloadStatus, ActivityError> {
        Ok(self.launcher.check_status(handle).await?)
    }

    pub async fn extract_results(&self, ctx: &ExtractionContext<'_>) -> Result<ExtractedResult, ActivityError> {
        let oracle = self.oracles.get(ctx.task.kind).ok_or_else(|| {
            ActivityError::fatal(
                FailureCategory::Internal,
                format!("no result oracle registered for {} executions", ctx.task.kind),
            )
        })?;
        let result = oracle.extract(ctx).await?;

        self.event_bus.publish(ExecutionEvent::ResultsExtracted {
            execution_id: ctx.execution_id,
            output_count: result.output_count,
            output_size_bytes: result.output_size_bytes,
            extracted_at: self.clock.now(),
        });
        Ok(result)
    }

    /// Tear down the workload and revoke the credential.
    ///
    /// Both are attempted independently; failures come back as warnings and
    /// are never escalated.
    pub async fn cleanup(
        &self,
        execution_id: ExecutionId,
        tenant_id: TenantId,
        handle: Option<&ExecutionHandle>,
        service_account_id: Option<ServiceAccountId>,
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        // a launch that died before returning a handle may still have created
        // the unit under its deterministic name
        let fallback = match (handle, service_account_id) {
            (None, Some(_)) => Some(ExecutionHandle::new(self.launcher.backend(), workload_name(execution_id))),
            _ => None,
        };

        if let Some(handle) = handle.or(fallback.as_ref()) {
            if let Err(e) = self.launcher.cleanup(handle).await {
                warn!(execution_id = %execution_id, error = %e, "Workload teardown failed");
                metrics::counter!("cordon_cleanup_failures_total", "resource" => "workload").increment(1);
                warnings.push(e.to_string());
            }
        }

        let mut to_revoke: Vec<ServiceAccountId> = service_account_id.into_iter().collect();
        match self.issuer.active_for_execution(execution_id).await {
            Ok(Some(active)) if !to_revoke.contains(&active) => to_revoke.push(active),
            Ok(_) => {}
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Could not look up active credentials");
                warnings.push(CleanupError::RevocationFailed(e.to_string()).to_string());
            }
        }

        for id in to_revoke {
            if let Err(e) = self.issuer.revoke(id, tenant_id).await {
                warn!(execution_id = %execution_id, service_account_id = %id, error = %e, "Credential revocation failed");
                metrics::counter!("cordon_cleanup_failures_total", "resource" => "credential").increment(1);
                warnings.push(CleanupError::RevocationFailed(e.to_string()).to_string());
            }
        }

        self.event_bus.publish(ExecutionEvent::CleanupCompleted {
            execution_id,
            warnings: warnings.clone(),
            completed_at: self.clock.now(),
        });
        warnings
    }

    /// The single terminal write. Returns `false` when the record was already terminal.
    pub async fn finalize(
        &self,
        execution_id: ExecutionId,
        outcome: &ExecutionOutcome,
        poll: &PollProgress,
        cleanup_warnings: &[String],
    ) -> Result<bool, ActivityError> {
        let mut record = self.load_record(execution_id).await?;
        let now = self.clock.now();

        let transition = match outcome {
            ExecutionOutcome::Succeeded { summary, output_size_bytes } => {
                record.complete(summary.clone(), *output_size_bytes, now)
            }
            ExecutionOutcome::Failed { category, message, execution_log } => {
                let log = execution_log
                    .clone()
                    .unwrap_or_else(|| render_execution_log(poll, cleanup_warnings));
                record.fail(*category, message.clone(), Some(log), now)
            }
        };

        let changed = match transition {
            Ok(changed) => changed,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Execution record already finalized differently");
                false
            }
        };
        if !changed {
            return Ok(false);
        }

        self.executions.save(&record).await?;

        let (status, category) = match outcome {
            ExecutionOutcome::Succeeded { output_size_bytes, .. } => {
                self.event_bus.publish(ExecutionEvent::ExecutionCompleted {
                    execution_id,
                    output_size_bytes: *output_size_bytes,
                    completed_at: now,
                });
                ("completed", "none")
            }
            ExecutionOutcome::Failed { category, message, .. } => {
                self.event_bus.publish(ExecutionEvent::ExecutionFailed {
                    execution_id,
                    category: *category,
                    reason: message.clone(),
                    failed_at: now,
                });
                ("failed", category.as_str())
            }
        };
        metrics::counter!("cordon_executions_finished_total", "status" => status, "category" => category)
            .increment(1);
        Ok(true)
    }
}

/// Partial log stored on failed records
fn render_execution_log(poll: &PollProgress, cleanup_warnings: &[String]) -> String {
    let mut lines = vec![format!(
        "status checks: {}, waited: {}s, last exit code: {}",
        poll.status_checks,
        poll.elapsed_secs,
        poll.last_exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string())
    )];
    lines.extend(cleanup_warnings.iter().map(|w| format!("cleanup: {}", w)));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::seconds(1),
            max_backoff: Duration::seconds(5),
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1), Duration::seconds(1));
        assert_eq!(policy.backoff(2), Duration::seconds(2));
        assert_eq!(policy.backoff(3), Duration::seconds(4));
        assert_eq!(policy.backoff(4), Duration::seconds(5));
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));
    }

    #[test]
    fn test_launch_error_classification() {
        let rejected: ActivityError = LaunchError::Rejected("image not found".into()).into();
        assert_eq!(
            rejected,
            ActivityError::fatal(FailureCategory::LaunchError, "Launch rejected: image not found")
        );
        let unavailable: ActivityError = LaunchError::Unavailable("connection refused".into()).into();
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn test_exhausted_retry_becomes_internal_failure() {
        let outcome = ActivityError::retryable("db down").into_outcome();
        assert_eq!(outcome, ExecutionOutcome::failed(FailureCategory::Internal, "db down"));
    }

    #[test]
    fn test_execution_log_includes_cleanup_warnings() {
        let poll = PollProgress {
            elapsed_secs: 30,
            status_checks: 3,
            last_exit_code: Some(2),
        };
        let log = render_execution_log(&poll, &["Failed to tear down x: gone".to_string()]);
        assert!(log.contains("status checks: 3"));
        assert!(log.contains("last exit code: 2"));
        assert!(log.contains("cleanup: Failed to tear down x: gone"));
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Execution Checkpoint
//!
//! Persisted state of one execution's orchestration: which step runs next,
//! when it may run (`wake_at` is the durable timer), and everything earlier
//! steps produced. A worker re-reads the checkpoint before every step and
//! writes it back after, so a crash loses at most the step in flight, which
//! is idempotent and simply runs again.
//!
//! ```text
//! MarkRunning -> Launch -> Poll (re-armed) -> ExtractResults
//!                  |         |                   |
//!                  +---------+-------------------+--> Cleanup -> Finalize -> Done
//! ```
//!
//! `Launch` issues the workload credential and starts the workload in one
//! step; the plaintext credential only ever lives in memory.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Crash-survivable orchestration state

use crate::domain::execution::{
    ExecutionId, ExecutionKind, FailureCategory, ParentJobId, TenantId, UserId,
};
use crate::domain::launcher::ExecutionHandle;
use crate::domain::service_account::ServiceAccountId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStep {
    MarkRunning,
    Launch,
    Poll,
    ExtractResults,
    Cleanup,
    Finalize,
    Done,
}

impl OrchestrationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStep::MarkRunning => "mark_running",
            OrchestrationStep::Launch => "launch",
            OrchestrationStep::Poll => "poll",
            OrchestrationStep::ExtractResults => "extract_results",
            OrchestrationStep::Cleanup => "cleanup",
            OrchestrationStep::Finalize => "finalize",
            OrchestrationStep::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mark_running" => Some(OrchestrationStep::MarkRunning),
            "launch" => Some(OrchestrationStep::Launch),
            "poll" => Some(OrchestrationStep::Poll),
            "extract_results" => Some(OrchestrationStep::ExtractResults),
            "cleanup" => Some(OrchestrationStep::Cleanup),
            "finalize" => Some(OrchestrationStep::Finalize),
            "done" => Some(OrchestrationStep::Done),
            _ => None,
        }
    }

    /// Steps whose failure must still be routed through cleanup
    pub fn requires_cleanup_on_failure(&self) -> bool {
        matches!(
            self,
            OrchestrationStep::Launch
                | OrchestrationStep::Poll
                | OrchestrationStep::ExtractResults
        )
    }
}

impl fmt::Display for OrchestrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the trigger caller asked for. Task parameters are opaque here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub kind: ExecutionKind,
    pub parent_job_id: ParentJobId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollProgress {
    /// Accumulated durable-timer wait, in seconds
    pub elapsed_secs: u64,
    pub status_checks: u32,
    pub last_exit_code: Option<i64>,
}

/// Outcome captured before cleanup, written to the record by `Finalize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded {
        summary: serde_json::Value,
        output_size_bytes: i64,
    },
    Failed {
        category: FailureCategory,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_log: Option<String>,
    },
}

impl ExecutionOutcome {
    pub fn failed(category: FailureCategory, message: impl Into<String>) -> Self {
        ExecutionOutcome::Failed {
            category,
            message: message.into(),
            execution_log: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Succeeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub task: ExecutionTask,
    #[serde(default)]
    pub service_account_id: Option<ServiceAccountId>,
    #[serde(default)]
    pub handle: Option<ExecutionHandle>,
    #[serde(default)]
    pub poll: PollProgress,
    #[serde(default)]
    pub outcome: Option<ExecutionOutcome>,
    /// Teardown problems, appended to the execution log of a failed record
    #[serde(default)]
    pub cleanup_warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCheckpoint {
    pub execution_id: ExecutionId,
    pub step: OrchestrationStep,
    pub state: CheckpointState,
    /// Attempts of the current step so far (activity retry policy)
    pub attempt: u32,
    pub wake_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionCheckpoint {
    pub fn new(execution_id: ExecutionId, task: ExecutionTask, now: DateTime<Utc>) -> Self {
        Self {
            execution_id,
            step: OrchestrationStep::MarkRunning,
            state: CheckpointState {
                task,
                service_account_id: None,
                handle: None,
                poll: PollProgress::default(),
                outcome: None,
                cleanup_warnings: Vec::new(),
            },
            attempt: 0,
            wake_at: now,
            lease_owner: None,
            lease_expires_at: None,
            updated_at: now,
        }
    }

    /// Move to `step`, due at `wake_at`, with a fresh attempt counter
    pub fn advance(&mut self, step: OrchestrationStep, wake_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.step = step;
        self.attempt = 0;
        self.wake_at = wake_at;
        self.updated_at = now;
    }

    /// Re-run the current step at `wake_at`
    pub fn schedule_retry(&mut self, wake_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.attempt += 1;
        self.wake_at = wake_at;
        self.updated_at = now;
    }

    /// Capture a failure and route the execution through cleanup.
    ///
    /// The first captured outcome wins; failures raised while already
    /// cleaning up never replace it.
    pub fn fail_into_cleanup(&mut self, outcome: ExecutionOutcome, now: DateTime<Utc>) {
        if self.state.outcome.is_none() {
            self.state.outcome = Some(outcome);
        }
        self.advance(OrchestrationStep::Cleanup, now, now);
    }

    pub fn is_finished(&self) -> bool {
        self.step == OrchestrationStep::Done
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lease_expires_at, Some(expiry) if expiry > now)
    }

    /// Due, unfinished and not held by a live lease
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_finished() && self.wake_at <= now && !self.is_leased(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn checkpoint(now: DateTime<Utc>) -> ExecutionCheckpoint {
        ExecutionCheckpoint::new(
            ExecutionId::new(),
            ExecutionTask {
                kind: ExecutionKind::Workflow,
                parent_job_id: ParentJobId(Uuid::new_v4()),
                tenant_id: TenantId::new(),
                user_id: UserId(Uuid::new_v4()),
                parameters: serde_json::json!({"document_ids": ["d1"]}),
            },
            now,
        )
    }

    #[test]
    fn test_new_checkpoint_is_due_immediately() {
        let now = Utc::now();
        let cp = checkpoint(now);
        assert_eq!(cp.step, OrchestrationStep::MarkRunning);
        assert!(cp.is_claimable(now));
    }

    #[test]
    fn test_lease_blocks_claim_until_expiry() {
        let now = Utc::now();
        let mut cp = checkpoint(now);
        cp.lease_owner = Some("worker-a".into());
        cp.lease_expires_at = Some(now + Duration::seconds(30));

        assert!(!cp.is_claimable(now));
        assert!(cp.is_claimable(now + Duration::seconds(31)));
    }

    #[test]
    fn test_first_failure_outcome_wins() {
        let now = Utc::now();
        let mut cp = checkpoint(now);
        cp.advance(OrchestrationStep::Poll, now, now);
        cp.fail_into_cleanup(
            ExecutionOutcome::failed(FailureCategory::ExecutionTimeout, "timed out"),
            now,
        );
        cp.fail_into_cleanup(ExecutionOutcome::failed(FailureCategory::Internal, "later"), now);

        assert_eq!(cp.step, OrchestrationStep::Cleanup);
        assert!(matches!(
            cp.state.outcome,
            Some(ExecutionOutcome::Failed { category: FailureCategory::ExecutionTimeout, .. })
        ));
    }

    #[test]
    fn test_retry_bumps_attempt_and_advance_resets_it() {
        let now = Utc::now();
        let mut cp = checkpoint(now);
        cp.schedule_retry(now + Duration::seconds(2), now);
        cp.schedule_retry(now + Duration::seconds(4), now);
        assert_eq!(cp.attempt, 2);
        assert!(!cp.is_claimable(now));

        cp.advance(OrchestrationStep::Launch, now, now);
        assert_eq!(cp.attempt, 0);
    }

    #[test]
    fn test_step_strings_roundtrip() {
        for step in [
            OrchestrationStep::MarkRunning,
            OrchestrationStep::Launch,
            OrchestrationStep::Poll,
            OrchestrationStep::ExtractResults,
            OrchestrationStep::Cleanup,
            OrchestrationStep::Finalize,
            OrchestrationStep::Done,
        ] {
            assert_eq!(OrchestrationStep::parse(step.as_str()), Some(step));
        }
    }
}

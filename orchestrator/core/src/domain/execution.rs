// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Execution Record Aggregate
//!
//! The durable row that API consumers read to follow one agent execution.
//! Only the orchestrator mutates it, and only at the transition points of the
//! execution state machine (mark running, complete, fail).
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Execution identity, status lifecycle and terminal outcome

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant that owns an execution and everything it produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User who triggered the execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workflow id or QA job id the execution belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentJobId(pub Uuid);

impl ParentJobId {
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for ParentJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which kind of agent an execution runs.
///
/// The kind selects the workload image and the result oracle; the state
/// machine itself is identical for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Document-workflow agent; signals success with an uploaded manifest
    Workflow,
    /// Agentic question answering; signals success by posting an answer record
    QuestionAnswering,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionKind::Workflow => "workflow",
            ExecutionKind::QuestionAnswering => "question_answering",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "workflow" => Some(ExecutionKind::Workflow),
            "question_answering" | "qa" => Some(ExecutionKind::QuestionAnswering),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy surfaced on failed records.
///
/// Lets operators tell "agent errored" apart from "agent never finished".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The launcher backend rejected the job specification
    LaunchError,
    /// Workload exited non-zero, or the manifest/answer was missing or malformed
    ExecutionFailed,
    /// The poll budget was exhausted while the workload was still running
    ExecutionTimeout,
    /// Infrastructure failure that outlived the activity retry policy
    Internal,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::LaunchError => "launch_error",
            FailureCategory::ExecutionFailed => "execution_failed",
            FailureCategory::ExecutionTimeout => "execution_timeout",
            FailureCategory::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "launch_error" => Some(FailureCategory::LaunchError),
            "execution_failed" => Some(FailureCategory::ExecutionFailed),
            "execution_timeout" => Some(FailureCategory::ExecutionTimeout),
            "internal" => Some(FailureCategory::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutionRecordError {
    #[error("Execution {id} is already {status}")]
    AlreadyTerminal { id: ExecutionId, status: ExecutionStatus },
    #[error("Execution {0} has not been marked running")]
    NotRunning(ExecutionId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub kind: ExecutionKind,
    pub parent_job_id: ParentJobId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_size_bytes: Option<i64>,
    pub output_summary: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_category: Option<FailureCategory>,
    pub execution_log: Option<String>,
}

impl ExecutionRecord {
    pub fn new(
        id: ExecutionId,
        kind: ExecutionKind,
        parent_job_id: ParentJobId,
        tenant_id: TenantId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            parent_job_id,
            tenant_id,
            user_id,
            status: ExecutionStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            output_size_bytes: None,
            output_summary: None,
            error_message: None,
            error_category: None,
            execution_log: None,
        }
    }

    /// Move `pending -> running`. Returns `Ok(false)` when already running.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<bool, ExecutionRecordError> {
        match self.status {
            ExecutionStatus::Pending => {
                self.status = ExecutionStatus::Running;
                self.started_at = Some(now);
                Ok(true)
            }
            ExecutionStatus::Running => Ok(false),
            status => Err(ExecutionRecordError::AlreadyTerminal { id: self.id, status }),
        }
    }

    /// Record the successful terminal outcome.
    ///
    /// Replaying the same transition is a no-op (`Ok(false)`); completing a
    /// failed record is refused.
    pub fn complete(
        &mut self,
        summary: serde_json::Value,
        output_size_bytes: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, ExecutionRecordError> {
        match self.status {
            ExecutionStatus::Running => {
                self.status = ExecutionStatus::Completed;
                self.output_summary = Some(summary);
                self.output_size_bytes = Some(output_size_bytes);
                self.completed_at = Some(now);
                Ok(true)
            }
            ExecutionStatus::Completed => Ok(false),
            ExecutionStatus::Pending => Err(ExecutionRecordError::NotRunning(self.id)),
            status => Err(ExecutionRecordError::AlreadyTerminal { id: self.id, status }),
        }
    }

    /// Record the failed terminal outcome. A pending record may fail directly.
    pub fn fail(
        &mut self,
        category: FailureCategory,
        message: impl Into<String>,
        execution_log: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, ExecutionRecordError> {
        match self.status {
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                self.status = ExecutionStatus::Failed;
                self.error_category = Some(category);
                self.error_message = Some(message.into());
                self.execution_log = execution_log;
                self.completed_at = Some(now);
                Ok(true)
            }
            ExecutionStatus::Failed => Ok(false),
            status => Err(ExecutionRecordError::AlreadyTerminal { id: self.id, status }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ExecutionRecord {
        ExecutionRecord::new(
            ExecutionId::new(),
            ExecutionKind::Workflow,
            ParentJobId(Uuid::new_v4()),
            TenantId::new(),
            UserId(Uuid::new_v4()),
            Utc::now(),
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut rec = record();
        assert_eq!(rec.status, ExecutionStatus::Pending);

        assert_eq!(rec.mark_running(Utc::now()), Ok(true));
        assert!(rec.started_at.is_some());
        assert_eq!(rec.mark_running(Utc::now()), Ok(false));

        let summary = serde_json::json!({ "files": 2 });
        assert_eq!(rec.complete(summary.clone(), 42, Utc::now()), Ok(true));
        assert_eq!(rec.status, ExecutionStatus::Completed);
        assert_eq!(rec.output_size_bytes, Some(42));
        assert_eq!(rec.output_summary, Some(summary.clone()));

        // replay is harmless
        assert_eq!(rec.complete(summary, 42, Utc::now()), Ok(false));
    }

    #[test]
    fn test_terminal_state_is_written_once() {
        let mut rec = record();
        rec.mark_running(Utc::now()).unwrap();
        rec.fail(FailureCategory::ExecutionTimeout, "timed out", None, Utc::now())
            .unwrap();

        let err = rec.complete(serde_json::json!({}), 0, Utc::now()).unwrap_err();
        assert!(matches!(err, ExecutionRecordError::AlreadyTerminal { .. }));
        assert_eq!(rec.status, ExecutionStatus::Failed);
        assert_eq!(rec.error_category, Some(FailureCategory::ExecutionTimeout));

        assert!(rec.mark_running(Utc::now()).is_err());
    }

    #[test]
    fn test_pending_record_cannot_complete_but_can_fail() {
        let mut rec = record();
        assert_eq!(
            rec.complete(serde_json::json!({}), 0, Utc::now()),
            Err(ExecutionRecordError::NotRunning(rec.id))
        );
        assert_eq!(
            rec.fail(FailureCategory::Internal, "boom", Some("log".into()), Utc::now()),
            Ok(true)
        );
        assert_eq!(rec.execution_log.as_deref(), Some("log"));
    }

    #[test]
    fn test_status_and_category_strings_roundtrip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            FailureCategory::parse("execution_timeout"),
            Some(FailureCategory::ExecutionTimeout)
        );
        assert_eq!(ExecutionKind::parse("qa"), Some(ExecutionKind::QuestionAnswering));
    }
}

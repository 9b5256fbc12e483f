// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::domain::checkpoint::OrchestrationStep;
use crate::domain::execution::{ExecutionId, ExecutionKind, FailureCategory, TenantId};
use crate::domain::launcher::{LauncherBackend, WorkloadState};
use crate::domain::service_account::ServiceAccountId;

/// Execution lifecycle events published by the state machine.
///
/// Events are informational; the execution record stays the authoritative
/// source of status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
    ExecutionRequested {
        execution_id: ExecutionId,
        tenant_id: TenantId,
        kind: ExecutionKind,
        requested_at: DateTime<Utc>,
    },
    ExecutionStarted {
        execution_id: ExecutionId,
        started_at: DateTime<Utc>,
    },
    CredentialIssued {
        execution_id: ExecutionId,
        service_account_id: ServiceAccountId,
        issued_at: DateTime<Utc>,
    },
    WorkloadLaunched {
        execution_id: ExecutionId,
        backend: LauncherBackend,
        workload_name: String,
        launched_at: DateTime<Utc>,
    },
    WorkloadPolled {
        execution_id: ExecutionId,
        state: WorkloadState,
        status_checks: u32,
        elapsed_secs: u64,
        polled_at: DateTime<Utc>,
    },
    ResultsExtracted {
        execution_id: ExecutionId,
        output_count: usize,
        output_size_bytes: i64,
        extracted_at: DateTime<Utc>,
    },
    StepRetryScheduled {
        execution_id: ExecutionId,
        step: OrchestrationStep,
        attempt: u32,
        error: String,
        retry_at: DateTime<Utc>,
    },
    CleanupCompleted {
        execution_id: ExecutionId,
        warnings: Vec<String>,
        completed_at: DateTime<Utc>,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        output_size_bytes: i64,
        completed_at: DateTime<Utc>,
    },
    ExecutionFailed {
        execution_id: ExecutionId,
        category: FailureCategory,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::ExecutionRequested { execution_id, .. }
            | ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::CredentialIssued { execution_id, .. }
            | ExecutionEvent::WorkloadLaunched { execution_id, .. }
            | ExecutionEvent::WorkloadPolled { execution_id, .. }
            | ExecutionEvent::ResultsExtracted { execution_id, .. }
            | ExecutionEvent::StepRetryScheduled { execution_id, .. }
            | ExecutionEvent::CleanupCompleted { execution_id, .. }
            | ExecutionEvent::ExecutionCompleted { execution_id, .. }
            | ExecutionEvent::ExecutionFailed { execution_id, .. } => *execution_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::ExecutionCompleted { .. } | ExecutionEvent::ExecutionFailed { .. }
        )
    }
}

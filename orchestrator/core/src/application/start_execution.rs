// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Start Agent Execution Use Case
//!
//! Application service the trigger callers (workflow runs, QA jobs) use to
//! request a sandboxed agent execution.
//!
//! # DDD Pattern: Application Service
//!
//! - **Layer:** Application
//! - **Responsibility:** Create the pending record and its first checkpoint
//! - **Collaborators:**
//!   - Domain: ExecutionRecord, ExecutionCheckpoint
//!   - Infrastructure: ExecutionRepository, CheckpointRepository, EventBus
//!
//! The call returns as soon as both rows exist; the worker pool picks the
//! checkpoint up asynchronously.

use crate::application::result_oracle::question_id;
use crate::domain::checkpoint::{ExecutionCheckpoint, ExecutionTask};
use crate::domain::clock::Clock;
use crate::domain::events::ExecutionEvent;
use crate::domain::execution::{
    ExecutionId, ExecutionKind, ExecutionRecord, ExecutionStatus, FailureCategory, ParentJobId,
    TenantId, UserId,
};
use crate::domain::repository::{CheckpointRepository, ExecutionRepository};
use crate::infrastructure::event_bus::EventBus;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Execution start request
#[derive(Debug, Clone, Deserialize)]
pub struct StartExecutionRequest {
    pub kind: ExecutionKind,
    pub parent_job_id: ParentJobId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    /// Opaque task parameters handed to the agent verbatim
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl StartExecutionRequest {
    pub fn workflow(
        workflow_id: ParentJobId,
        tenant_id: TenantId,
        user_id: UserId,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: ExecutionKind::Workflow,
            parent_job_id: workflow_id,
            tenant_id,
            user_id,
            parameters,
        }
    }

    /// QA executions answer one question; its id is merged into the parameters
    pub fn question_answering(
        qa_job_id: ParentJobId,
        tenant_id: TenantId,
        user_id: UserId,
        question_id: Uuid,
        parameters: serde_json::Value,
    ) -> Self {
        let mut parameters = match parameters {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        parameters.insert(
            "question_id".to_string(),
            serde_json::Value::String(question_id.to_string()),
        );
        Self {
            kind: ExecutionKind::QuestionAnswering,
            parent_job_id: qa_job_id,
            tenant_id,
            user_id,
            parameters: serde_json::Value::Object(parameters),
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.parameters.is_object() || self.parameters.is_null()) {
            anyhow::bail!("Task parameters must be a JSON object");
        }
        if self.kind == ExecutionKind::QuestionAnswering && question_id(&self.parameters).is_none() {
            anyhow::bail!("Question answering executions require a valid 'question_id' parameter");
        }
        Ok(())
    }
}

/// Started execution response
#[derive(Debug, Clone, Serialize)]
pub struct StartedExecution {
    pub execution_id: ExecutionId,
    pub kind: ExecutionKind,
    pub status: ExecutionStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait StartAgentExecutionUseCase: Send + Sync {
    /// Register a new execution and schedule its orchestration.
    ///
    /// # Errors
    ///
    /// - Invalid request (non-object parameters, QA without question id)
    /// - Persistence failure of the record or checkpoint
    async fn start(&self, request: StartExecutionRequest) -> Result<StartedExecution>;
}

pub struct StandardStartAgentExecutionUseCase {
    executions: Arc<dyn ExecutionRepository>,
    checkpoints: Arc<dyn CheckpointRepository>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl StandardStartAgentExecutionUseCase {
    pub fn new(
        executions: Arc<dyn ExecutionRepository>,
        checkpoints: Arc<dyn CheckpointRepository>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executions,
            checkpoints,
            event_bus,
            clock,
        }
    }
}

#[async_trait]
impl StartAgentExecutionUseCase for StandardStartAgentExecutionUseCase {
    async fn start(&self, request: StartExecutionRequest) -> Result<StartedExecution> {
        request.validate()?;

        let now = self.clock.now();
        let execution_id = ExecutionId::new();
        let record = ExecutionRecord::new(
            execution_id,
            request.kind,
            request.parent_job_id,
            request.tenant_id,
            request.user_id,
            now,
        );

        self.executions
            .save(&record)
            .await
            .context("Failed to persist execution record")?;

        let task = ExecutionTask {
            kind: request.kind,
            parent_job_id: request.parent_job_id,
            tenant_id: request.tenant_id,
            user_id: request.user_id,
            parameters: request.parameters,
        };
        let checkpoint = ExecutionCheckpoint::new(execution_id, task, now);

        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            error!(execution_id = %execution_id, "Failed to schedule execution: {}", e);
            // don't leave a pending record nobody will ever pick up
            let mut record = record;
            if record
                .fail(FailureCategory::Internal, format!("failed to schedule execution: {}", e), None, now)
                .is_ok()
            {
                if let Err(save_err) = self.executions.save(&record).await {
                    warn!(execution_id = %execution_id, "Failed to mark unscheduled execution as failed: {}", save_err);
                }
            }
            return Err(anyhow::Error::new(e).context("Failed to persist execution checkpoint"));
        }

        metrics::counter!("cordon_executions_started_total", "kind" => request.kind.as_str()).increment(1);
        self.event_bus.publish(ExecutionEvent::ExecutionRequested {
            execution_id,
            tenant_id: request.tenant_id,
            kind: request.kind,
            requested_at: now,
        });
        info!(execution_id = %execution_id, kind = %request.kind, tenant_id = %request.tenant_id, "Execution scheduled");

        Ok(StartedExecution {
            execution_id,
            kind: request.kind,
            status: ExecutionStatus::Pending,
            created_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::checkpoint::OrchestrationStep;
    use crate::domain::clock::SystemClock;
    use crate::domain::repository::RepositoryError;
    use crate::infrastructure::repositories::{InMemoryCheckpointRepository, InMemoryExecutionRepository};
    use chrono::{DateTime, Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Checkpoint store that is down
    struct UnavailableCheckpoints;

    fn unavailable() -> RepositoryError {
        RepositoryError::Database("connection refused".to_string())
    }

    #[async_trait]
    impl CheckpointRepository for UnavailableCheckpoints {
        async fn save(&self, _: &ExecutionCheckpoint) -> Result<(), RepositoryError> {
            Err(unavailable())
        }
        async fn find_by_id(&self, _: ExecutionId) -> Result<Option<ExecutionCheckpoint>, RepositoryError> {
            Err(unavailable())
        }
        async fn claim_due(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: Duration,
            _: usize,
        ) -> Result<Vec<ExecutionCheckpoint>, RepositoryError> {
            Err(unavailable())
        }
        async fn commit(&self, _: &ExecutionCheckpoint, _: &str) -> Result<(), RepositoryError> {
            Err(unavailable())
        }
        async fn renew_lease(&self, _: ExecutionId, _: &str, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<(), RepositoryError> {
            Err(unavailable())
        }
        async fn find_unfinished(&self, _: usize) -> Result<Vec<ExecutionCheckpoint>, RepositoryError> {
            Err(unavailable())
        }
    }

    /// Accepts the first `allowed` saves, then fails
    struct ExecutionsFailingAfter {
        inner: InMemoryExecutionRepository,
        allowed: usize,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionRepository for ExecutionsFailingAfter {
        async fn save(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
            if self.saves.fetch_add(1, Ordering::SeqCst) >= self.allowed {
                return Err(unavailable());
            }
            self.inner.save(record).await
        }
        async fn find_by_id(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, RepositoryError> {
            self.inner.find_by_id(id).await
        }
        async fn find_by_parent_job(
            &self,
            tenant_id: TenantId,
            parent_job_id: ParentJobId,
        ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
            self.inner.find_by_parent_job(tenant_id, parent_job_id).await
        }
        async fn find_recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<ExecutionRecord>, RepositoryError> {
            self.inner.find_recent(tenant_id, limit).await
        }
    }

    fn workflow_request(tenant_id: TenantId) -> StartExecutionRequest {
        StartExecutionRequest::workflow(
            ParentJobId(Uuid::new_v4()),
            tenant_id,
            UserId(Uuid::new_v4()),
            serde_json::json!({}),
        )
    }

    fn use_case() -> (
        StandardStartAgentExecutionUseCase,
        Arc<InMemoryExecutionRepository>,
        Arc<InMemoryCheckpointRepository>,
    ) {
        let executions = Arc::new(InMemoryExecutionRepository::new());
        let checkpoints = Arc::new(InMemoryCheckpointRepository::new());
        let uc = StandardStartAgentExecutionUseCase::new(
            executions.clone(),
            checkpoints.clone(),
            EventBus::new(16),
            Arc::new(SystemClock),
        );
        (uc, executions, checkpoints)
    }

    #[tokio::test]
    async fn test_start_creates_pending_record_and_due_checkpoint() {
        let (uc, executions, checkpoints) = use_case();
        let request = StartExecutionRequest::workflow(
            ParentJobId(Uuid::new_v4()),
            TenantId::new(),
            UserId(Uuid::new_v4()),
            serde_json::json!({"document_ids": ["a", "b"]}),
        );

        let started = uc.start(request).await.unwrap();
        assert_eq!(started.status, ExecutionStatus::Pending);

        let record = executions.find_by_id(started.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert_eq!(record.kind, ExecutionKind::Workflow);

        let cp = checkpoints.find_by_id(started.execution_id).await.unwrap().unwrap();
        assert_eq!(cp.step, OrchestrationStep::MarkRunning);
        assert_eq!(cp.state.task.parameters["document_ids"][1], "b");
    }

    #[tokio::test]
    async fn test_question_answering_requires_question_id() {
        let (uc, _, _) = use_case();
        let mut request = StartExecutionRequest::question_answering(
            ParentJobId(Uuid::new_v4()),
            TenantId::new(),
            UserId(Uuid::new_v4()),
            Uuid::new_v4(),
            serde_json::json!({"tone": "concise"}),
        );
        assert_eq!(request.parameters["tone"], "concise");
        assert!(uc.start(request.clone()).await.is_ok());

        request.parameters = serde_json::json!({"tone": "concise"});
        assert!(uc.start(request).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_non_object_parameters() {
        let (uc, _, _) = use_case();
        let request = StartExecutionRequest::workflow(
            ParentJobId(Uuid::new_v4()),
            TenantId::new(),
            UserId(Uuid::new_v4()),
            serde_json::json!([1, 2, 3]),
        );
        assert!(uc.start(request).await.is_err());
    }

    #[tokio::test]
    async fn test_unschedulable_execution_is_failed_not_left_pending() {
        let executions = Arc::new(InMemoryExecutionRepository::new());
        let uc = StandardStartAgentExecutionUseCase::new(
            executions.clone(),
            Arc::new(UnavailableCheckpoints),
            EventBus::new(16),
            Arc::new(SystemClock),
        );
        let tenant_id = TenantId::new();

        assert!(uc.start(workflow_request(tenant_id)).await.is_err());

        let records = executions.find_recent(tenant_id, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Failed);
        assert_eq!(records[0].error_category, Some(FailureCategory::Internal));
    }

    #[tokio::test]
    async fn test_failed_compensating_write_still_reports_the_schedule_error() {
        let executions = Arc::new(ExecutionsFailingAfter {
            inner: InMemoryExecutionRepository::new(),
            allowed: 1,
            saves: AtomicUsize::new(0),
        });
        let uc = StandardStartAgentExecutionUseCase::new(
            executions.clone(),
            Arc::new(UnavailableCheckpoints),
            EventBus::new(16),
            Arc::new(SystemClock),
        );
        let tenant_id = TenantId::new();

        let err = uc.start(workflow_request(tenant_id)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to persist execution checkpoint"));
        assert_eq!(executions.saves.load(Ordering::SeqCst), 2);

        let records = executions.find_recent(tenant_id, 10).await.unwrap();
        assert_eq!(records[0].status, ExecutionStatus::Pending);
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Read side of the execution record, always scoped to a tenant.

use crate::domain::checkpoint::OrchestrationStep;
use crate::domain::execution::{ExecutionId, ExecutionRecord, ParentJobId, TenantId};
use crate::domain::manifest::OutputFile;
use crate::domain::repository::{
    CheckpointRepository, ExecutionRepository, OutputFileRepository, RepositoryError,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    /// Also returned for executions owned by another tenant
    #[error("Execution {0} not found")]
    NotFound(ExecutionId),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDetails {
    pub record: ExecutionRecord,
    pub output_files: Vec<OutputFile>,
    /// Orchestration step in flight; `None` once the checkpoint is gone
    pub current_step: Option<OrchestrationStep>,
}

pub struct ExecutionQueryService {
    executions: Arc<dyn ExecutionRepository>,
    output_files: Arc<dyn OutputFileRepository>,
    checkpoints: Arc<dyn CheckpointRepository>,
}

impl ExecutionQueryService {
    pub fn new(
        executions: Arc<dyn ExecutionRepository>,
        output_files: Arc<dyn OutputFileRepository>,
        checkpoints: Arc<dyn CheckpointRepository>,
    ) -> Self {
        Self {
            executions,
            output_files,
            checkpoints,
        }
    }

    pub async fn get_execution(
        &self,
        tenant_id: TenantId,
        execution_id: ExecutionId,
    ) -> Result<ExecutionRecord, QueryError> {
        match self.executions.find_by_id(execution_id).await? {
            Some(record) if record.tenant_id == tenant_id => Ok(record),
            _ => Err(QueryError::NotFound(execution_id)),
        }
    }

    pub async fn list_for_parent_job(
        &self,
        tenant_id: TenantId,
        parent_job_id: ParentJobId,
    ) -> Result<Vec<ExecutionRecord>, QueryError> {
        Ok(self.executions.find_by_parent_job(tenant_id, parent_job_id).await?)
    }

    pub async fn list_recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<ExecutionRecord>, QueryError> {
        Ok(self.executions.find_recent(tenant_id, limit).await?)
    }

    pub async fn list_output_files(
        &self,
        tenant_id: TenantId,
        execution_id: ExecutionId,
    ) -> Result<Vec<OutputFile>, QueryError> {
        self.get_execution(tenant_id, execution_id).await?;
        Ok(self.output_files.find_by_execution(tenant_id, execution_id).await?)
    }

    /// Record, output files and current orchestration step in one call
    pub async fn describe(
        &self,
        tenant_id: TenantId,
        execution_id: ExecutionId,
    ) -> Result<ExecutionDetails, QueryError> {
        let record = self.get_execution(tenant_id, execution_id).await?;
        let output_files = self.output_files.find_by_execution(tenant_id, execution_id).await?;
        let current_step = self
            .checkpoints
            .find_by_id(execution_id)
            .await?
            .map(|cp| cp.step);
        Ok(ExecutionDetails {
            record,
            output_files,
            current_step,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::execution::{ExecutionKind, UserId};
    use crate::infrastructure::repositories::{
        InMemoryCheckpointRepository, InMemoryExecutionRepository, InMemoryOutputFileRepository,
    };
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_other_tenants_see_not_found() {
        let executions = Arc::new(InMemoryExecutionRepository::new());
        let service = ExecutionQueryService::new(
            executions.clone(),
            Arc::new(InMemoryOutputFileRepository::new()),
            Arc::new(InMemoryCheckpointRepository::new()),
        );

        let owner = TenantId::new();
        let job = ParentJobId(Uuid::new_v4());
        let record = ExecutionRecord::new(
            ExecutionId::new(),
            ExecutionKind::Workflow,
            job,
            owner,
            UserId(Uuid::new_v4()),
            Utc::now(),
        );
        executions.save(&record).await.unwrap();

        assert_eq!(service.get_execution(owner, record.id).await.unwrap().id, record.id);
        assert!(matches!(
            service.get_execution(TenantId::new(), record.id).await,
            Err(QueryError::NotFound(_))
        ));
        assert!(service.list_output_files(TenantId::new(), record.id).await.is_err());
        assert_eq!(service.list_for_parent_job(owner, job).await.unwrap().len(), 1);
        assert!(service.list_for_parent_job(TenantId::new(), job).await.unwrap().is_empty());

        let details = service.describe(owner, record.id).await.unwrap();
        assert!(details.output_files.is_empty());
        assert_eq!(details.current_step, None);
    }
}

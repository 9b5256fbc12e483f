// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstractions defined in
//! the domain layer, following the Repository pattern from DDD.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve domain aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! - **PostgresExecutionRepository** - Execution records
//! - **PostgresCheckpointRepository** - Durable orchestration state with leases
//! - **PostgresServiceAccountRepository** - Execution-scoped credentials
//! - **PostgresOutputFileRepository** - Output file rows from manifests
//! - **PostgresAnswerRepository** - QA answers (read by the result oracle)
//!
//! ## In-Memory Repositories
//!
//! Lock-protected `HashMap`s with the same semantics, for tests and
//! single-process development. Checkpoint leases and the one-active-account
//! rule are enforced here exactly as the SQL constraints enforce them.

pub mod postgres_answer;
pub mod postgres_checkpoint;
pub mod postgres_execution;
pub mod postgres_output_file;
pub mod postgres_service_account;

pub use postgres_answer::PostgresAnswerRepository;
pub use postgres_checkpoint::PostgresCheckpointRepository;
pub use postgres_execution::PostgresExecutionRepository;
pub use postgres_output_file::PostgresOutputFileRepository;
pub use postgres_service_account::PostgresServiceAccountRepository;

use crate::domain::answer::AnswerRecord;
use crate::domain::checkpoint::ExecutionCheckpoint;
use crate::domain::execution::{ExecutionId, ExecutionRecord, ParentJobId, TenantId};
use crate::domain::manifest::{OutputFile, OutputFileId};
use crate::domain::repository::{
    AnswerRepository, CheckpointRepository, ExecutionRepository, OutputFileRepository,
    RepositoryError, ServiceAccountRepository,
};
use crate::domain::service_account::{ServiceAccount, ServiceAccountId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct InMemoryExecutionRepository {
    executions: Arc<RwLock<HashMap<ExecutionId, ExecutionRecord>>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        self.executions.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, RepositoryError> {
        Ok(self.executions.read().get(&id).cloned())
    }

    async fn find_by_parent_job(
        &self,
        tenant_id: TenantId,
        parent_job_id: ParentJobId,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let executions = self.executions.read();
        let mut list: Vec<ExecutionRecord> = executions
            .values()
            .filter(|e| e.tenant_id == tenant_id && e.parent_job_id == parent_job_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn find_recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let executions = self.executions.read();
        let mut list: Vec<ExecutionRecord> = executions
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list.into_iter().take(limit).collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryCheckpointRepository {
    checkpoints: Arc<RwLock<HashMap<ExecutionId, ExecutionCheckpoint>>>,
}

impl InMemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn save(&self, checkpoint: &ExecutionCheckpoint) -> Result<(), RepositoryError> {
        self.checkpoints
            .write()
            .insert(checkpoint.execution_id, checkpoint.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<ExecutionCheckpoint>, RepositoryError> {
        Ok(self.checkpoints.read().get(&id).cloned())
    }

    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ExecutionCheckpoint>, RepositoryError> {
        let mut checkpoints = self.checkpoints.write();
        let mut due: Vec<&mut ExecutionCheckpoint> = checkpoints
            .values_mut()
            .filter(|cp| cp.is_claimable(now))
            .collect();
        due.sort_by(|a, b| a.wake_at.cmp(&b.wake_at));

        Ok(due
            .into_iter()
            .take(limit)
            .map(|cp| {
                cp.lease_owner = Some(owner.to_string());
                cp.lease_expires_at = Some(now + lease);
                cp.clone()
            })
            .collect())
    }

    async fn commit(&self, checkpoint: &ExecutionCheckpoint, owner: &str) -> Result<(), RepositoryError> {
        let mut checkpoints = self.checkpoints.write();
        let stored = checkpoints
            .get_mut(&checkpoint.execution_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("checkpoint {}", checkpoint.execution_id)))?;

        if stored.lease_owner.as_deref() != Some(owner) {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} is not leased to {}",
                checkpoint.execution_id, owner
            )));
        }

        let mut updated = checkpoint.clone();
        updated.lease_owner = None;
        updated.lease_expires_at = None;
        *stored = updated;
        Ok(())
    }

    async fn renew_lease(
        &self,
        id: ExecutionId,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut checkpoints = self.checkpoints.write();
        let stored = checkpoints
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("checkpoint {}", id)))?;

        if stored.lease_owner.as_deref() != Some(owner) || !stored.is_leased(now) {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} is not leased to {}",
                id, owner
            )));
        }
        stored.lease_expires_at = Some(until);
        Ok(())
    }

    async fn find_unfinished(&self, limit: usize) -> Result<Vec<ExecutionCheckpoint>, RepositoryError> {
        let checkpoints = self.checkpoints.read();
        let mut list: Vec<ExecutionCheckpoint> = checkpoints
            .values()
            .filter(|cp| !cp.is_finished())
            .cloned()
            .collect();
        list.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(list.into_iter().take(limit).collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryServiceAccountRepository {
    accounts: Arc<RwLock<HashMap<ServiceAccountId, ServiceAccount>>>,
}

impl InMemoryServiceAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every account ever stored for an execution, active or not
    pub fn all_for_execution(&self, execution_id: ExecutionId) -> Vec<ServiceAccount> {
        self.accounts
            .read()
            .values()
            .filter(|a| a.execution_id == execution_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ServiceAccountRepository for InMemoryServiceAccountRepository {
    async fn insert_active(&self, account: &ServiceAccount) -> Result<(), RepositoryError> {
        let mut accounts = self.accounts.write();
        if accounts
            .values()
            .any(|a| a.active && a.execution_id == account.execution_id)
        {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already has an active service account",
                account.execution_id
            )));
        }
        accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn save(&self, account: &ServiceAccount) -> Result<(), RepositoryError> {
        self.accounts.write().insert(account.id, account.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: ServiceAccountId) -> Result<Option<ServiceAccount>, RepositoryError> {
        Ok(self.accounts.read().get(&id).cloned())
    }

    async fn find_active_by_execution(&self, execution_id: ExecutionId) -> Result<Option<ServiceAccount>, RepositoryError> {
        Ok(self
            .accounts
            .read()
            .values()
            .find(|a| a.active && a.execution_id == execution_id)
            .cloned())
    }

    async fn find_by_credential_hash(&self, hash: &str) -> Result<Option<ServiceAccount>, RepositoryError> {
        Ok(self
            .accounts
            .read()
            .values()
            .find(|a| a.credential_hash == hash)
            .cloned())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryOutputFileRepository {
    files: Arc<RwLock<HashMap<OutputFileId, OutputFile>>>,
}

impl InMemoryOutputFileRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutputFileRepository for InMemoryOutputFileRepository {
    async fn save(&self, file: &OutputFile) -> Result<(), RepositoryError> {
        self.files.write().insert(file.id, file.clone());
        Ok(())
    }

    async fn find_by_execution(
        &self,
        tenant_id: TenantId,
        execution_id: ExecutionId,
    ) -> Result<Vec<OutputFile>, RepositoryError> {
        let files = self.files.read();
        let mut list: Vec<OutputFile> = files
            .values()
            .filter(|f| f.tenant_id == tenant_id && f.execution_id == execution_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAnswerRepository {
    answers: Arc<RwLock<HashMap<Uuid, AnswerRecord>>>,
}

impl InMemoryAnswerRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnswerRepository for InMemoryAnswerRepository {
    async fn save(&self, answer: &AnswerRecord) -> Result<(), RepositoryError> {
        self.answers.write().insert(answer.id, answer.clone());
        Ok(())
    }

    async fn find_for_question(
        &self,
        tenant_id: TenantId,
        qa_job_id: ParentJobId,
        question_id: Uuid,
    ) -> Result<Option<AnswerRecord>, RepositoryError> {
        let answers = self.answers.read();
        Ok(answers
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.qa_job_id == qa_job_id && a.question_id == question_id)
            .max_by_key(|a| a.created_at)
            .cloned())
    }
}

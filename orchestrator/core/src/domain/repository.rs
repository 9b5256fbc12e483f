// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces (AGENTS.md §Repository Patterns)
//!
//! Persistence contracts for each aggregate the orchestrator reads or owns,
//! following the DDD Repository pattern: interface defined in the domain
//! layer, implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `ExecutionRepository` | `ExecutionRecord` | `InMemoryExecutionRepository`, `PostgresExecutionRepository` |
//! | `CheckpointRepository` | `ExecutionCheckpoint` | `InMemoryCheckpointRepository`, `PostgresCheckpointRepository` |
//! | `ServiceAccountRepository` | `ServiceAccount` | `InMemoryServiceAccountRepository`, `PostgresServiceAccountRepository` |
//! | `OutputFileRepository` | `OutputFile` | `InMemoryOutputFileRepository`, `PostgresOutputFileRepository` |
//! | `AnswerRepository` | `AnswerRecord` | `InMemoryAnswerRepository`, `PostgresAnswerRepository` |
//!
//! Every query that returns tenant data takes the tenant id; cross-tenant
//! reads come back empty.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;
use crate::domain::answer::AnswerRecord;
use crate::domain::checkpoint::ExecutionCheckpoint;
use crate::domain::execution::{ExecutionId, ExecutionRecord, ParentJobId, TenantId};
use crate::domain::manifest::OutputFile;
use crate::domain::service_account::{ServiceAccount, ServiceAccountId};

/// Repository interface for Execution records
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Save execution (create or update)
    async fn save(&self, record: &ExecutionRecord) -> Result<(), RepositoryError>;

    /// Find execution by ID (not tenant-scoped; the orchestrator owns every record)
    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, RepositoryError>;

    /// Executions belonging to one workflow / QA job
    async fn find_by_parent_job(
        &self,
        tenant_id: TenantId,
        parent_job_id: ParentJobId,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError>;

    /// Most recently created executions for a tenant
    async fn find_recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<ExecutionRecord>, RepositoryError>;
}

/// Repository interface for durable orchestration state
#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    /// Create or overwrite a checkpoint (no lease check)
    async fn save(&self, checkpoint: &ExecutionCheckpoint) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<ExecutionCheckpoint>, RepositoryError>;

    /// Atomically lease up to `limit` due checkpoints to `owner`.
    ///
    /// A checkpoint is due when its `wake_at` has passed, it is not finished,
    /// and no unexpired lease is held on it.
    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ExecutionCheckpoint>, RepositoryError>;

    /// Persist the result of a step and drop the lease.
    ///
    /// Fails with [`RepositoryError::Conflict`] if `owner` no longer holds the
    /// lease, so a stalled worker cannot overwrite progress made by another.
    async fn commit(&self, checkpoint: &ExecutionCheckpoint, owner: &str) -> Result<(), RepositoryError>;

    /// Extend a lease still held by `owner` to `until`.
    ///
    /// Fails with [`RepositoryError::Conflict`] once the lease has expired or
    /// been taken over.
    async fn renew_lease(
        &self,
        id: ExecutionId,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Unfinished checkpoints, oldest first
    async fn find_unfinished(&self, limit: usize) -> Result<Vec<ExecutionCheckpoint>, RepositoryError>;
}

/// Repository interface for execution-scoped service accounts
#[async_trait]
pub trait ServiceAccountRepository: Send + Sync {
    /// Insert a new active account.
    ///
    /// Fails with [`RepositoryError::Conflict`] if the execution already has
    /// an active account.
    async fn insert_active(&self, account: &ServiceAccount) -> Result<(), RepositoryError>;

    /// Update an existing account (revocation)
    async fn save(&self, account: &ServiceAccount) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: ServiceAccountId) -> Result<Option<ServiceAccount>, RepositoryError>;

    async fn find_active_by_execution(&self, execution_id: ExecutionId) -> Result<Option<ServiceAccount>, RepositoryError>;

    async fn find_by_credential_hash(&self, hash: &str) -> Result<Option<ServiceAccount>, RepositoryError>;
}

/// Repository interface for output file rows
#[async_trait]
pub trait OutputFileRepository: Send + Sync {
    /// Upsert by file id
    async fn save(&self, file: &OutputFile) -> Result<(), RepositoryError>;

    async fn find_by_execution(
        &self,
        tenant_id: TenantId,
        execution_id: ExecutionId,
    ) -> Result<Vec<OutputFile>, RepositoryError>;
}

/// Repository interface for QA answers (written by the platform API on the agent's behalf)
#[async_trait]
pub trait AnswerRepository: Send + Sync {
    async fn save(&self, answer: &AnswerRecord) -> Result<(), RepositoryError>;

    async fn find_for_question(
        &self,
        tenant_id: TenantId,
        qa_job_id: ParentJobId,
        question_id: Uuid,
    ) -> Result<Option<AnswerRecord>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(db.message().to_string())
            }
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

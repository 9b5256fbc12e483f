// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Durable orchestration state in PostgreSQL.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers (in one process
//! or many) never lease the same checkpoint; commits are conditional on the
//! committing worker still holding the lease.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use crate::domain::checkpoint::{CheckpointState, ExecutionCheckpoint, OrchestrationStep};
use crate::domain::execution::ExecutionId;
use crate::domain::repository::{CheckpointRepository, RepositoryError};

const COLUMNS: &str = "execution_id, step, state, attempt, wake_at, lease_owner, lease_expires_at, updated_at";

pub struct PostgresCheckpointRepository {
    pool: PgPool,
}

impl PostgresCheckpointRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn checkpoint_from_row(row: &PgRow) -> Result<ExecutionCheckpoint, RepositoryError> {
    let step_str: String = row.try_get("step")?;
    let step = OrchestrationStep::parse(&step_str)
        .ok_or_else(|| RepositoryError::Serialization(format!("unknown orchestration step '{}'", step_str)))?;
    let state: CheckpointState = serde_json::from_value(row.try_get("state")?)?;
    let attempt: i32 = row.try_get("attempt")?;

    Ok(ExecutionCheckpoint {
        execution_id: ExecutionId(row.try_get("execution_id")?),
        step,
        state,
        attempt: attempt.max(0) as u32,
        wake_at: row.try_get("wake_at")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CheckpointRepository for PostgresCheckpointRepository {
    async fn save(&self, checkpoint: &ExecutionCheckpoint) -> Result<(), RepositoryError> {
        let state = serde_json::to_value(&checkpoint.state)?;

        sqlx::query(
            r#"
            INSERT INTO execution_checkpoints (
                execution_id, step, state, attempt, wake_at, lease_owner, lease_expires_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (execution_id) DO UPDATE SET
                step = EXCLUDED.step,
                state = EXCLUDED.state,
                attempt = EXCLUDED.attempt,
                wake_at = EXCLUDED.wake_at,
                lease_owner = EXCLUDED.lease_owner,
                lease_expires_at = EXCLUDED.lease_expires_at,
                updated_at = EXCLUDED.updated_at
            "#
        )
        .bind(checkpoint.execution_id.0)
        .bind(checkpoint.step.as_str())
        .bind(state)
        .bind(checkpoint.attempt as i32)
        .bind(checkpoint.wake_at)
        .bind(&checkpoint.lease_owner)
        .bind(checkpoint.lease_expires_at)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to save checkpoint: {}", e)))?;

        Ok(())
    }

    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<ExecutionCheckpoint>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM execution_checkpoints WHERE execution_id = $1", COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ExecutionCheckpoint>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE execution_checkpoints
            SET lease_owner = $1, lease_expires_at = $2
            WHERE execution_id IN (
                SELECT execution_id FROM execution_checkpoints
                WHERE step <> 'done'
                  AND wake_at <= $3
                  AND (lease_expires_at IS NULL OR lease_expires_at <= $3)
                ORDER BY wake_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(owner)
        .bind(now + lease)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows
            .iter()
            .map(checkpoint_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| a.wake_at.cmp(&b.wake_at));
        Ok(claimed)
    }

    async fn commit(&self, checkpoint: &ExecutionCheckpoint, owner: &str) -> Result<(), RepositoryError> {
        let state = serde_json::to_value(&checkpoint.state)?;

        let result = sqlx::query(
            r#"
            UPDATE execution_checkpoints
            SET step = $2, state = $3, attempt = $4, wake_at = $5, updated_at = $6,
                lease_owner = NULL, lease_expires_at = NULL
            WHERE execution_id = $1 AND lease_owner = $7
            "#
        )
        .bind(checkpoint.execution_id.0)
        .bind(checkpoint.step.as_str())
        .bind(state)
        .bind(checkpoint.attempt as i32)
        .bind(checkpoint.wake_at)
        .bind(checkpoint.updated_at)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} is not leased to {}",
                checkpoint.execution_id, owner
            )));
        }
        Ok(())
    }

    async fn renew_lease(
        &self,
        id: ExecutionId,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE execution_checkpoints
            SET lease_expires_at = $3
            WHERE execution_id = $1 AND lease_owner = $2 AND lease_expires_at > $4
            "#
        )
        .bind(id.0)
        .bind(owner)
        .bind(until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} is not leased to {}",
                id, owner
            )));
        }
        Ok(())
    }

    async fn find_unfinished(&self, limit: usize) -> Result<Vec<ExecutionCheckpoint>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM execution_checkpoints WHERE step <> 'done' ORDER BY updated_at LIMIT $1",
            COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(checkpoint_from_row).collect()
    }
}

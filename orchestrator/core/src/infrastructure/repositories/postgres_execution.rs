// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use crate::domain::repository::{ExecutionRepository, RepositoryError};
use crate::domain::execution::{
    ExecutionId, ExecutionKind, ExecutionRecord, ExecutionStatus, FailureCategory, ParentJobId,
    TenantId, UserId,
};

const SELECT_COLUMNS: &str = r#"
    id, kind, parent_job_id, tenant_id, user_id, status, created_at, started_at,
    completed_at, output_size_bytes, output_summary, error_message, error_category,
    execution_log
"#;

pub struct PostgresExecutionRepository {
    pool: PgPool,
}

impl PostgresExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &PgRow) -> Result<ExecutionRecord, RepositoryError> {
    let kind_str: String = row.try_get("kind")?;
    let status_str: String = row.try_get("status")?;
    let category_str: Option<String> = row.try_get("error_category")?;

    let kind = ExecutionKind::parse(&kind_str)
        .ok_or_else(|| RepositoryError::Serialization(format!("unknown execution kind '{}'", kind_str)))?;
    let status = ExecutionStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Serialization(format!("unknown execution status '{}'", status_str)))?;
    let error_category = match category_str {
        Some(s) => Some(
            FailureCategory::parse(&s)
                .ok_or_else(|| RepositoryError::Serialization(format!("unknown failure category '{}'", s)))?,
        ),
        None => None,
    };

    Ok(ExecutionRecord {
        id: ExecutionId(row.try_get("id")?),
        kind,
        parent_job_id: ParentJobId(row.try_get("parent_job_id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        user_id: UserId(row.try_get("user_id")?),
        status,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        output_size_bytes: row.try_get("output_size_bytes")?,
        output_summary: row.try_get("output_summary")?,
        error_message: row.try_get("error_message")?,
        error_category,
        execution_log: row.try_get("execution_log")?,
    })
}

#[async_trait]
impl ExecutionRepository for PostgresExecutionRepository {
    async fn save(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO agent_executions (
                id, kind, parent_job_id, tenant_id, user_id, status, created_at,
                started_at, completed_at, output_size_bytes, output_summary,
                error_message, error_category, execution_log
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                output_size_bytes = EXCLUDED.output_size_bytes,
                output_summary = EXCLUDED.output_summary,
                error_message = EXCLUDED.error_message,
                error_category = EXCLUDED.error_category,
                execution_log = EXCLUDED.execution_log
            "#
        )
        .bind(record.id.0)
        .bind(record.kind.as_str())
        .bind(record.parent_job_id.0)
        .bind(record.tenant_id.0)
        .bind(record.user_id.0)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.output_size_bytes)
        .bind(&record.output_summary)
        .bind(&record.error_message)
        .bind(record.error_category.map(|c| c.as_str()))
        .bind(&record.execution_log)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to save execution: {}", e)))?;

        Ok(())
    }

    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM agent_executions WHERE id = $1", SELECT_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_by_parent_job(
        &self,
        tenant_id: TenantId,
        parent_job_id: ParentJobId,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM agent_executions WHERE tenant_id = $1 AND parent_job_id = $2 ORDER BY created_at",
            SELECT_COLUMNS
        ))
        .bind(tenant_id.0)
        .bind(parent_job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn find_recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM agent_executions WHERE tenant_id = $1 ORDER BY created_at DESC LIMIT $2",
            SELECT_COLUMNS
        ))
        .bind(tenant_id.0)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

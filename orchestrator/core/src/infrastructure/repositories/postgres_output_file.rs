// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use crate::domain::execution::{ExecutionId, ParentJobId, TenantId};
use crate::domain::manifest::{OutputFile, OutputFileId};
use crate::domain::repository::{OutputFileRepository, RepositoryError};

pub struct PostgresOutputFileRepository {
    pool: PgPool,
}

impl PostgresOutputFileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutputFileRepository for PostgresOutputFileRepository {
    async fn save(&self, file: &OutputFile) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO execution_output_files (
                id, tenant_id, parent_job_id, execution_id, name, storage_key,
                size_bytes, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                storage_key = EXCLUDED.storage_key,
                size_bytes = EXCLUDED.size_bytes,
                metadata = EXCLUDED.metadata
            "#
        )
        .bind(file.id.0)
        .bind(file.tenant_id.0)
        .bind(file.parent_job_id.0)
        .bind(file.execution_id.0)
        .bind(&file.name)
        .bind(&file.storage_key)
        .bind(file.size_bytes)
        .bind(&file.metadata)
        .bind(file.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to save output file: {}", e)))?;

        Ok(())
    }

    async fn find_by_execution(
        &self,
        tenant_id: TenantId,
        execution_id: ExecutionId,
    ) -> Result<Vec<OutputFile>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, parent_job_id, execution_id, name, storage_key,
                   size_bytes, metadata, created_at
            FROM execution_output_files
            WHERE tenant_id = $1 AND execution_id = $2
            ORDER BY name
            "#
        )
        .bind(tenant_id.0)
        .bind(execution_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(OutputFile {
                    id: OutputFileId(row.try_get("id")?),
                    tenant_id: TenantId(row.try_get("tenant_id")?),
                    parent_job_id: ParentJobId(row.try_get("parent_job_id")?),
                    execution_id: ExecutionId(row.try_get("execution_id")?),
                    name: row.try_get("name")?,
                    storage_key: row.try_get("storage_key")?,
                    size_bytes: row.try_get("size_bytes")?,
                    metadata: row.try_get("metadata")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

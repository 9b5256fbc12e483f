// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use crate::domain::execution::{ExecutionId, TenantId};
use crate::domain::repository::{RepositoryError, ServiceAccountRepository};
use crate::domain::service_account::{ServiceAccount, ServiceAccountId};

const COLUMNS: &str = "id, tenant_id, execution_id, credential_hash, active, created_at, revoked_at";

pub struct PostgresServiceAccountRepository {
    pool: PgPool,
}

impl PostgresServiceAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn account_from_row(row: &PgRow) -> Result<ServiceAccount, RepositoryError> {
    Ok(ServiceAccount {
        id: ServiceAccountId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        execution_id: ExecutionId(row.try_get("execution_id")?),
        credential_hash: row.try_get("credential_hash")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}

#[async_trait]
impl ServiceAccountRepository for PostgresServiceAccountRepository {
    async fn insert_active(&self, account: &ServiceAccount) -> Result<(), RepositoryError> {
        // the partial unique index on (execution_id) WHERE active turns a
        // second live credential into a unique violation -> Conflict
        sqlx::query(
            r#"
            INSERT INTO execution_service_accounts (
                id, tenant_id, execution_id, credential_hash, active, created_at, revoked_at
            )
            VALUES ($1, $2, $3, $4, TRUE, $5, NULL)
            "#
        )
        .bind(account.id.0)
        .bind(account.tenant_id.0)
        .bind(account.execution_id.0)
        .bind(&account.credential_hash)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save(&self, account: &ServiceAccount) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE execution_service_accounts
            SET active = $2, revoked_at = $3
            WHERE id = $1
            "#
        )
        .bind(account.id.0)
        .bind(account.active)
        .bind(account.revoked_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: ServiceAccountId) -> Result<Option<ServiceAccount>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM execution_service_accounts WHERE id = $1", COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_active_by_execution(&self, execution_id: ExecutionId) -> Result<Option<ServiceAccount>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM execution_service_accounts WHERE execution_id = $1 AND active",
            COLUMNS
        ))
        .bind(execution_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_by_credential_hash(&self, hash: &str) -> Result<Option<ServiceAccount>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM execution_service_accounts WHERE credential_hash = $1",
            COLUMNS
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Connection Pool
//!
//! Wraps `sqlx::postgres::PgPool` in a thin `Database` newtype that can be
//! injected into all PostgreSQL repository implementations, and owns the
//! embedded schema migrations.

use crate::domain::node_config::{resolve_env_value, DatabaseConfig};
use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .context("Failed to connect to database")?;

        Ok(Self { pool })
    }

    /// Connect using the `spec.database` section, running migrations if enabled
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let url = resolve_env_value(&config.url)?;
        let db = Self::new(&url, config.max_connections).await?;
        if config.run_migrations {
            db.migrate().await?;
        }
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("Failed to apply migrations")?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }
}

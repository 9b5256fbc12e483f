// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Execution-scoped Service Accounts
//!
//! A service account is the short-lived API credential handed to one agent
//! workload so it can call back into the platform with least privilege. It is
//! bound 1:1 to an execution and a tenant, minted right before launch and
//! revoked unconditionally during cleanup.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Service account entity and the Credential Issuer contract

use crate::domain::execution::{ExecutionId, TenantId};
use crate::domain::repository::RepositoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceAccountId(pub Uuid);

impl ServiceAccountId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ServiceAccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServiceAccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub id: ServiceAccountId,
    pub tenant_id: TenantId,
    pub execution_id: ExecutionId,
    /// Hex SHA-256 of the plaintext credential; the plaintext is never stored
    pub credential_hash: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ServiceAccount {
    /// Deactivate the account. Returns `false` if it was already revoked.
    pub fn revoke(&mut self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.revoked_at = Some(now);
        true
    }
}

/// Plaintext API credential, available exactly once at creation.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredential(String);

impl ApiCredential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiCredential(***)")
    }
}

#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub service_account_id: ServiceAccountId,
    pub credential: ApiCredential,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Execution {0} already has an active service account")]
    AlreadyIssued(ExecutionId),

    #[error("Service account {service_account_id} does not belong to tenant {tenant_id}")]
    TenantMismatch {
        service_account_id: ServiceAccountId,
        tenant_id: TenantId,
    },

    #[error("Credential store error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Failed to generate credential: {0}")]
    Generation(String),
}

#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Mint a credential bound to one execution and tenant.
    ///
    /// Fails with [`CredentialError::AlreadyIssued`] if the execution still
    /// holds an active credential.
    async fn create(
        &self,
        execution_id: ExecutionId,
        tenant_id: TenantId,
    ) -> Result<IssuedCredential, CredentialError>;

    /// Revoke a credential. Unknown or already revoked ids are a no-op.
    async fn revoke(
        &self,
        service_account_id: ServiceAccountId,
        tenant_id: TenantId,
    ) -> Result<(), CredentialError>;

    /// Active account currently bound to an execution, if any.
    ///
    /// Lets the orchestrator find a credential it minted but never recorded
    /// (crash between issue and checkpoint write) so it can be revoked.
    async fn active_for_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ServiceAccountId>, CredentialError>;

    /// Resolve a presented credential to its active service account
    async fn authenticate(
        &self,
        credential: &str,
    ) -> Result<Option<ServiceAccount>, CredentialError>;
}

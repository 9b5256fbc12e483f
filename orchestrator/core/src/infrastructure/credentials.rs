// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service account credential issuer
//!
//! Credentials are `cx_` followed by 32 random bytes, base64url encoded. Only
//! the SHA-256 of a credential is stored; the plaintext exists once, in the
//! return value of [`CredentialIssuer::create`].

use std::sync::Arc;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use crate::domain::clock::Clock;
use crate::domain::execution::{ExecutionId, TenantId};
use crate::domain::repository::{RepositoryError, ServiceAccountRepository};
use crate::domain::service_account::{
    ApiCredential, CredentialError, CredentialIssuer, IssuedCredential, ServiceAccount,
    ServiceAccountId,
};

pub const CREDENTIAL_PREFIX: &str = "cx_";
const CREDENTIAL_BYTES: usize = 32;

pub struct ServiceAccountIssuer {
    accounts: Arc<dyn ServiceAccountRepository>,
    clock: Arc<dyn Clock>,
}

impl ServiceAccountIssuer {
    pub fn new(accounts: Arc<dyn ServiceAccountRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { accounts, clock }
    }
}

fn generate_credential() -> Result<ApiCredential, CredentialError> {
    let mut bytes = [0u8; CREDENTIAL_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CredentialError::Generation(e.to_string()))?;
    Ok(ApiCredential::new(format!("{}{}", CREDENTIAL_PREFIX, URL_SAFE_NO_PAD.encode(bytes))))
}

pub fn hash_credential(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

#[async_trait]
impl CredentialIssuer for ServiceAccountIssuer {
    async fn create(
        &self,
        execution_id: ExecutionId,
        tenant_id: TenantId,
    ) -> Result<IssuedCredential, CredentialError> {
        let credential = generate_credential()?;
        let account = ServiceAccount {
            id: ServiceAccountId::new(),
            tenant_id,
            execution_id,
            credential_hash: hash_credential(credential.expose()),
            active: true,
            created_at: self.clock.now(),
            revoked_at: None,
        };

        match self.accounts.insert_active(&account).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => return Err(CredentialError::AlreadyIssued(execution_id)),
            Err(e) => return Err(e.into()),
        }

        info!(
            execution_id = %execution_id,
            service_account_id = %account.id,
            "Issued execution service account"
        );
        Ok(IssuedCredential {
            service_account_id: account.id,
            credential,
        })
    }

    async fn revoke(
        &self,
        service_account_id: ServiceAccountId,
        tenant_id: TenantId,
    ) -> Result<(), CredentialError> {
        let Some(mut account) = self.accounts.find_by_id(service_account_id).await? else {
            debug!(service_account_id = %service_account_id, "Revoking unknown service account, nothing to do");
            return Ok(());
        };

        if account.tenant_id != tenant_id {
            return Err(CredentialError::TenantMismatch {
                service_account_id,
                tenant_id,
            });
        }

        if account.revoke(self.clock.now()) {
            self.accounts.save(&account).await?;
            info!(
                execution_id = %account.execution_id,
                service_account_id = %service_account_id,
                "Revoked execution service account"
            );
        }
        Ok(())
    }

    async fn active_for_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ServiceAccountId>, CredentialError> {
        Ok(self
            .accounts
            .find_active_by_execution(execution_id)
            .await?
            .map(|account| account.id))
    }

    async fn authenticate(&self, credential: &str) -> Result<Option<ServiceAccount>, CredentialError> {
        if !credential.starts_with(CREDENTIAL_PREFIX) {
            return Ok(None);
        }
        let hash = hash_credential(credential);
        let Some(account) = self.accounts.find_by_credential_hash(&hash).await? else {
            return Ok(None);
        };

        let matches: bool = account.credential_hash.as_bytes().ct_eq(hash.as_bytes()).into();
        if matches && account.active {
            Ok(Some(account))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::SystemClock;
    use crate::infrastructure::repositories::InMemoryServiceAccountRepository;

    fn issuer() -> (ServiceAccountIssuer, Arc<InMemoryServiceAccountRepository>) {
        let repo = Arc::new(InMemoryServiceAccountRepository::new());
        (ServiceAccountIssuer::new(repo.clone(), Arc::new(SystemClock)), repo)
    }

    #[test]
    fn test_credential_format() {
        let a = generate_credential().unwrap();
        let b = generate_credential().unwrap();
        assert!(a.expose().starts_with(CREDENTIAL_PREFIX));
        // 32 bytes -> 43 base64url chars without padding
        assert_eq!(a.expose().len(), CREDENTIAL_PREFIX.len() + 43);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_create_stores_only_the_hash() {
        let (issuer, repo) = issuer();
        let execution = ExecutionId::new();
        let issued = issuer.create(execution, TenantId::new()).await.unwrap();

        let stored = repo.find_by_id(issued.service_account_id).await.unwrap().unwrap();
        assert_eq!(stored.credential_hash, hash_credential(issued.credential.expose()));
        assert_ne!(stored.credential_hash, issued.credential.expose());
        assert!(stored.active);
    }

    #[tokio::test]
    async fn test_one_active_credential_per_execution() {
        let (issuer, _) = issuer();
        let execution = ExecutionId::new();
        let tenant = TenantId::new();

        let first = issuer.create(execution, tenant).await.unwrap();
        assert!(matches!(
            issuer.create(execution, tenant).await,
            Err(CredentialError::AlreadyIssued(id)) if id == execution
        ));
        assert_eq!(
            issuer.active_for_execution(execution).await.unwrap(),
            Some(first.service_account_id)
        );

        issuer.revoke(first.service_account_id, tenant).await.unwrap();
        assert_eq!(issuer.active_for_execution(execution).await.unwrap(), None);
        assert!(issuer.create(execution, tenant).await.is_ok());
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent_and_tenant_scoped() {
        let (issuer, repo) = issuer();
        let tenant = TenantId::new();
        let issued = issuer.create(ExecutionId::new(), tenant).await.unwrap();

        let other_tenant = TenantId::new();
        assert!(matches!(
            issuer.revoke(issued.service_account_id, other_tenant).await,
            Err(CredentialError::TenantMismatch { .. })
        ));
        assert!(repo.find_by_id(issued.service_account_id).await.unwrap().unwrap().active);

        issuer.revoke(issued.service_account_id, tenant).await.unwrap();
        let revoked_at = repo.find_by_id(issued.service_account_id).await.unwrap().unwrap().revoked_at;
        issuer.revoke(issued.service_account_id, tenant).await.unwrap();
        assert_eq!(
            repo.find_by_id(issued.service_account_id).await.unwrap().unwrap().revoked_at,
            revoked_at
        );

        // unknown ids are a no-op
        issuer.revoke(ServiceAccountId::new(), tenant).await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticate() {
        let (issuer, _) = issuer();
        let tenant = TenantId::new();
        let issued = issuer.create(ExecutionId::new(), tenant).await.unwrap();

        let account = issuer.authenticate(issued.credential.expose()).await.unwrap().unwrap();
        assert_eq!(account.id, issued.service_account_id);
        assert!(issuer.authenticate("cx_not-a-real-credential").await.unwrap().is_none());
        assert!(issuer.authenticate("Bearer nonsense").await.unwrap().is_none());

        issuer.revoke(issued.service_account_id, tenant).await.unwrap();
        assert!(issuer.authenticate(issued.credential.expose()).await.unwrap().is_none());
    }
}

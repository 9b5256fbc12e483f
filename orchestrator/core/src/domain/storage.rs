// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Object Store Trait - Anti-Corruption Layer for blob storage
//!
//! Agents upload their outputs and manifest directly to object storage; the
//! orchestrator reads them back through this trait. Keys are plain relative
//! strings such as `"{tenant}/{job}/executions/{execution}/.manifest.json"`.
//!
//! Follows DDD Anti-Corruption Layer pattern from AGENTS.md.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Metadata for a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

/// Object store abstraction
///
/// Implementations:
/// - `LocalObjectStore` (filesystem, single node)
/// - `InMemoryObjectStore` (tests and single-shot runs)
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` at `key`, replacing any existing object
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    /// Fetch an object. Missing objects are `Ok(None)`, not an error.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// Object metadata without downloading the content
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError>;

    /// Time-limited URL an agent can `PUT` to without other credentials
    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    /// Time-limited grant to `PUT` any single file directly under `prefix`
    async fn presign_prefix_put(&self, prefix: &str, ttl: Duration) -> Result<String, StorageError>;

    /// Check health of storage backend
    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Reject keys that could escape the store's namespace
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    if key.split('/').any(|segment| segment == ".." || segment == "." || segment.is_empty()) {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout while communicating with storage backend")]
    Timeout,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Unknown storage error: {0}")]
    Unknown(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(err.to_string()),
            _ => StorageError::IoError(err.to_string()),
        }
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local Filesystem Object Store
//!
//! Objects are plain files under a base directory, one file per key. Meant
//! for single-node deployments and development; agents still upload through
//! presigned URLs, accepted by an [`UploadReceiver`](super::UploadReceiver)
//! writing into the same directory.
//!
//! **Limitations:**
//! - No multi-node sharing (objects only visible on this machine)
//! - No replication

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use crate::domain::storage::{validate_key, ObjectMeta, ObjectStore, StorageError};
use super::UrlSigner;

pub struct LocalObjectStore {
    base_path: PathBuf,
    signer: UrlSigner,
}

impl LocalObjectStore {
    /// Create the store, making sure the base directory exists and is writable.
    pub fn new(base_path: impl Into<PathBuf>, signer: UrlSigner) -> Result<Self, StorageError> {
        let base_path = base_path.into();

        std::fs::create_dir_all(&base_path)
            .map_err(|e| StorageError::IoError(format!(
                "Failed to create base directory {}: {}",
                base_path.display(),
                e
            )))?;

        let test_file = base_path.join(".cordon-storage-test");
        std::fs::write(&test_file, b"test")
            .map_err(|e| StorageError::IoError(format!(
                "Base directory {} is not writable: {}",
                base_path.display(),
                e
            )))?;
        std::fs::remove_file(&test_file)
            .map_err(|e| StorageError::IoError(format!("Failed to cleanup test file: {}", e)))?;

        Ok(Self { base_path, signer })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // write-then-rename so readers never observe a partial object
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        self.signer.presign_put(key, ttl)
    }

    async fn presign_prefix_put(&self, prefix: &str, ttl: Duration) -> Result<String, StorageError> {
        self.signer.presign_prefix_put(prefix, ttl)
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let meta = tokio::fs::metadata(&self.base_path).await?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!(
                "{} is not a directory",
                self.base_path.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> LocalObjectStore {
        LocalObjectStore::new(dir.path(), UrlSigner::new("http://objects.local", b"k".to_vec())).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_head() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        store
            .put("tenant/job/executions/e/outputs/report.md", Bytes::from_static(b"# Report"))
            .await
            .unwrap();

        let data = store.get("tenant/job/executions/e/outputs/report.md").await.unwrap().unwrap();
        assert_eq!(&data[..], b"# Report");

        let meta = store.head("tenant/job/executions/e/outputs/report.md").await.unwrap().unwrap();
        assert_eq!(meta.size, 8);
        assert!(temp_dir.path().join("tenant/job/executions/e/outputs/report.md").exists());
    }

    #[tokio::test]
    async fn test_missing_objects_are_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        assert!(store.get("nope/missing.json").await.unwrap().is_none());
        assert!(store.head("nope/missing.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directory_is_not_an_object() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        store.put("a/b/c", Bytes::from_static(b"x")).await.unwrap();
        assert!(store.head("a/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let result = store.put("../outside", Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
        let result = store.get("/etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        store.put("k/v", Bytes::from_static(b"first")).await.unwrap();
        store.put("k/v", Bytes::from_static(b"2nd")).await.unwrap();
        assert_eq!(store.head("k/v").await.unwrap().unwrap().size, 3);
    }

    #[tokio::test]
    async fn test_health_check() {
        let temp_dir = TempDir::new().unwrap();
        store(&temp_dir).health_check().await.unwrap();
    }
}

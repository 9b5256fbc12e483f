// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Storage Infrastructure Module
//!
//! Concrete [`ObjectStore`] backends plus the HMAC signer shared by both of
//! them for presigned upload URLs. Agents never receive storage credentials;
//! they receive a URL for the manifest and a grant for their `outputs/`
//! prefix, both of which expire. [`UploadReceiver`] is the accepting side.

pub mod local;

pub use local::LocalObjectStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use percent_encoding::percent_decode_str;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;
use crate::domain::node_config::{resolve_env_value, StorageBackendKind, StorageConfig};
use crate::domain::storage::{validate_key, ObjectMeta, ObjectStore, StorageError};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies time-limited upload URLs.
///
/// Object grant: `{base}/{key}?method=PUT&expires={unix}&signature={hex}`,
/// signed over `"PUT\n{key}\n{expires}"`.
///
/// Prefix grant: `{base}/{prefix}/?method=PUT&prefix={prefix}&expires=..&signature=..`,
/// signed over `"PUT\n{prefix}/\n{expires}"`. The holder appends one file
/// name to the path. A key never ends in `/`, so the two cannot be confused.
#[derive(Clone)]
pub struct UrlSigner {
    base_url: String,
    key: Vec<u8>,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").field("base_url", &self.base_url).finish()
    }
}

impl UrlSigner {
    pub fn new(base_url: impl Into<String>, key: Vec<u8>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key,
        }
    }

    fn mac(&self, method: &str, scope: &str, expires: i64) -> Result<HmacSha256, StorageError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| StorageError::Unknown(format!("invalid signing key: {}", e)))?;
        mac.update(format!("{}\n{}\n{}", method, scope, expires).as_bytes());
        Ok(mac)
    }

    fn base(&self) -> Result<Url, StorageError> {
        Url::parse(&self.base_url)
            .map_err(|e| StorageError::Unknown(format!("invalid upload base URL {}: {}", self.base_url, e)))
    }

    fn signed_url(
        &self,
        method: &str,
        path: &str,
        scope: &str,
        prefix: Option<&str>,
        expires: i64,
    ) -> Result<String, StorageError> {
        let signature = hex::encode(self.mac(method, scope, expires)?.finalize().into_bytes());

        let mut url = self.base()?;
        url.path_segments_mut()
            .map_err(|_| StorageError::Unknown(format!("upload base URL {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(path.split('/'));
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("method", method);
            if let Some(prefix) = prefix {
                query.append_pair("prefix", prefix);
            }
            query
                .append_pair("expires", &expires.to_string())
                .append_pair("signature", &signature);
        }
        Ok(url.to_string())
    }

    pub fn sign(&self, method: &str, key: &str, expires_at: DateTime<Utc>) -> Result<String, StorageError> {
        validate_key(key)?;
        self.signed_url(method, key, key, None, expires_at.timestamp())
    }

    /// Grant `PUT` on every direct child of `prefix`
    pub fn sign_prefix(&self, prefix: &str, expires_at: DateTime<Utc>) -> Result<String, StorageError> {
        validate_key(prefix)?;
        let scope = format!("{}/", prefix);
        // trailing empty segment keeps the slash the holder appends to
        self.signed_url("PUT", &scope, &scope, Some(prefix), expires_at.timestamp())
    }

    /// Check a presented signature. Expired or tampered requests return `false`.
    fn verify(&self, method: &str, scope: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool {
        if now.timestamp() > expires {
            return false;
        }
        let Ok(presented) = hex::decode(signature) else {
            return false;
        };
        match self.mac(method, scope, expires) {
            Ok(mac) => mac.verify_slice(&presented).is_ok(),
            Err(_) => false,
        }
    }

    /// Resolve a presented upload URL to the object key it may write.
    ///
    /// Fails with [`StorageError::PermissionDenied`] unless the URL was issued
    /// by this signer for `method`, has not expired, and (for a prefix grant)
    /// names exactly one file under the granted prefix.
    pub fn authorize(&self, method: &str, url: &str, now: DateTime<Utc>) -> Result<String, StorageError> {
        let denied = |reason: &str| StorageError::PermissionDenied(format!("upload URL rejected: {}", reason));

        let url = Url::parse(url).map_err(|_| denied("not a URL"))?;
        let base = self.base()?;
        if url.scheme() != base.scheme()
            || url.host_str() != base.host_str()
            || url.port_or_known_default() != base.port_or_known_default()
        {
            return Err(denied("issued for another endpoint"));
        }

        let base_segments: Vec<&str> = base.path_segments().into_iter().flatten().filter(|s| !s.is_empty()).collect();
        let segments: Vec<&str> = url.path_segments().into_iter().flatten().collect();
        if segments.len() <= base_segments.len() || segments[..base_segments.len()] != base_segments[..] {
            return Err(denied("outside the upload endpoint"));
        }
        let key = segments[base_segments.len()..]
            .iter()
            .map(|s| percent_decode_str(s).decode_utf8().map(|s| s.into_owned()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| denied("path is not UTF-8"))?
            .join("/");
        validate_key(&key)?;

        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        if params.get("method").map(String::as_str) != Some(method) {
            return Err(denied("wrong method"));
        }
        let expires: i64 = params
            .get("expires")
            .and_then(|e| e.parse().ok())
            .ok_or_else(|| denied("missing expiry"))?;
        let signature = params.get("signature").ok_or_else(|| denied("missing signature"))?;

        let scope = match params.get("prefix") {
            Some(prefix) => {
                let name = key
                    .strip_prefix(prefix.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                    .ok_or_else(|| denied("outside the granted prefix"))?;
                if name.contains('/') {
                    return Err(denied("nested paths are not granted"));
                }
                format!("{}/", prefix)
            }
            None => key.clone(),
        };

        if !self.verify(method, &scope, expires, signature, now) {
            return Err(denied("bad or expired signature"));
        }
        Ok(key)
    }

    pub fn presign_put(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        self.sign("PUT", key, expires_after(ttl)?)
    }

    pub fn presign_prefix_put(&self, prefix: &str, ttl: Duration) -> Result<String, StorageError> {
        self.sign_prefix(prefix, expires_after(ttl)?)
    }
}

fn expires_after(ttl: Duration) -> Result<DateTime<Utc>, StorageError> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| StorageError::Unknown(format!("invalid URL lifetime: {}", e)))?;
    Ok(Utc::now() + ttl)
}

/// Accepting side of presigned uploads: checks the URL, then stores the body
pub struct UploadReceiver {
    store: Arc<dyn ObjectStore>,
    signer: UrlSigner,
}

impl UploadReceiver {
    pub fn new(store: Arc<dyn ObjectStore>, signer: UrlSigner) -> Self {
        Self { store, signer }
    }

    pub async fn receive(&self, url: &str, data: Bytes) -> Result<ObjectMeta, StorageError> {
        self.receive_at(url, data, Utc::now()).await
    }

    pub async fn receive_at(&self, url: &str, data: Bytes, now: DateTime<Utc>) -> Result<ObjectMeta, StorageError> {
        let key = match self.signer.authorize("PUT", url, now) {
            Ok(key) => key,
            Err(e) => {
                warn!("Refused upload: {}", e);
                return Err(e);
            }
        };
        let size = data.len() as u64;
        self.store.put(&key, data).await?;
        info!(key = %key, size, "Stored signed upload");
        Ok(ObjectMeta { key, size })
    }
}

/// Signer configured by `spec.storage`
pub fn create_url_signer(config: &StorageConfig) -> anyhow::Result<UrlSigner> {
    let signing_key = resolve_env_value(&config.signing_key)?;
    if signing_key.is_empty() {
        anyhow::bail!("storage.signing_key resolved to an empty value");
    }
    Ok(UrlSigner::new(config.upload_base_url.clone(), signing_key.into_bytes()))
}

/// Build the configured object store
pub fn create_object_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let signer = create_url_signer(config)?;

    let store: Arc<dyn ObjectStore> = match config.backend {
        StorageBackendKind::Local => Arc::new(LocalObjectStore::new(&config.path, signer)?),
        StorageBackendKind::Memory => Arc::new(InMemoryObjectStore::with_signer(signer)),
    };

    info!(backend = ?config.backend, "Object store initialized");
    Ok(store)
}

/// Process-local object store for tests and single-shot local runs
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Bytes>>,
    signer: UrlSigner,
}

impl InMemoryObjectStore {
    pub fn new(base_url: impl Into<String>, signing_key: Vec<u8>) -> Self {
        Self::with_signer(UrlSigner::new(base_url, signing_key))
    }

    pub fn with_signer(signer: UrlSigner) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            signer,
        }
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        validate_key(key)?;
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        validate_key(key)?;
        Ok(self.objects.read().get(key).cloned())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        validate_key(key)?;
        Ok(self.objects.read().get(key).map(|data| ObjectMeta {
            key: key.to_string(),
            size: data.len() as u64,
        }))
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        self.signer.presign_put(key, ttl)
    }

    async fn presign_prefix_put(&self, prefix: &str, ttl: Duration) -> Result<String, StorageError> {
        self.signer.presign_prefix_put(prefix, ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_param(url: &str, name: &str) -> String {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[test]
    fn test_signed_url_authorizes_until_expiry() {
        let signer = UrlSigner::new("http://objects.local/v1/objects/", b"secret".to_vec());
        let now = Utc::now();
        let url = signer.sign("PUT", "t/j/executions/e/.manifest.json", now + chrono::Duration::minutes(5)).unwrap();

        assert!(url.starts_with("http://objects.local/v1/objects/t/j/executions/e/.manifest.json?"));
        assert_eq!(signer.authorize("PUT", &url, now).unwrap(), "t/j/executions/e/.manifest.json");
        assert!(matches!(signer.authorize("GET", &url, now), Err(StorageError::PermissionDenied(_))));
        assert!(signer.authorize("PUT", &url, now + chrono::Duration::minutes(6)).is_err());

        // same signature, different object
        let moved = url.replace("/executions/e/", "/executions/other/");
        assert!(signer.authorize("PUT", &moved, now).is_err());
    }

    #[test]
    fn test_signature_depends_on_key() {
        let a = UrlSigner::new("http://objects.local", b"one".to_vec());
        let b = UrlSigner::new("http://objects.local", b"two".to_vec());
        let now = Utc::now();
        let url = a.sign("PUT", "k/v", now + chrono::Duration::minutes(1)).unwrap();
        assert!(a.authorize("PUT", &url, now).is_ok());
        assert!(b.authorize("PUT", &url, now).is_err());
    }

    #[test]
    fn test_prefix_grant_covers_direct_children_only() {
        let signer = UrlSigner::new("http://objects.local/v1/objects", b"secret".to_vec());
        let now = Utc::now();
        let grant = signer.sign_prefix("t/j/executions/e/outputs", now + chrono::Duration::minutes(5)).unwrap();
        assert_eq!(query_param(&grant, "prefix"), "t/j/executions/e/outputs");

        let (path, query) = grant.split_once('?').unwrap();
        assert!(path.ends_with("/outputs/"));
        let upload = |name: &str| format!("{}{}?{}", path, name, query);

        assert_eq!(
            signer.authorize("PUT", &upload("summary%20v2.md"), now).unwrap(),
            "t/j/executions/e/outputs/summary v2.md"
        );
        assert!(signer.authorize("PUT", &upload("nested/x.md"), now).is_err());
        assert!(signer.authorize("PUT", &upload(""), now).is_err());

        // the grant does not reach the manifest or a sibling execution
        let manifest = upload("x").replace("/outputs/x", "/.manifest.json");
        assert!(signer.authorize("PUT", &manifest, now).is_err());
        let sibling = upload("x.md")
            .replace("executions/e/", "executions/other/")
            .replace("executions%2Fe%2F", "executions%2Fother%2F");
        assert!(signer.authorize("PUT", &sibling, now).is_err());
    }

    #[test]
    fn test_urls_for_another_endpoint_are_refused() {
        let signer = UrlSigner::new("http://objects.local/v1/objects", b"secret".to_vec());
        let now = Utc::now();
        let url = signer.sign("PUT", "k/v", now + chrono::Duration::minutes(1)).unwrap();
        let elsewhere = url.replace("objects.local", "evil.example");
        assert!(signer.authorize("PUT", &elsewhere, now).is_err());
        let outside = url.replace("/v1/objects/", "/v2/objects/");
        assert!(signer.authorize("PUT", &outside, now).is_err());
    }

    #[tokio::test]
    async fn test_receiver_stores_only_authorized_uploads() {
        let signer = UrlSigner::new("http://objects.local", b"secret".to_vec());
        let store = Arc::new(InMemoryObjectStore::with_signer(signer.clone()));
        let receiver = UploadReceiver::new(store.clone(), signer.clone());

        let url = store.presign_put("t/j/executions/e/.manifest.json", Duration::from_secs(60)).await.unwrap();
        let meta = receiver.receive(&url, Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(meta.size, 2);
        assert_eq!(store.get("t/j/executions/e/.manifest.json").await.unwrap().unwrap(), Bytes::from_static(b"{}"));

        let forged = url.replace("signature=", "signature=00");
        let err = receiver.receive(&forged, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));

        let expired = signer.sign("PUT", "t/j/late", Utc::now() - chrono::Duration::seconds(1)).unwrap();
        assert!(receiver.receive(&expired, Bytes::from_static(b"x")).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sign_rejects_escaping_keys() {
        let signer = UrlSigner::new("http://objects.local", b"k".to_vec());
        assert!(matches!(
            signer.sign("PUT", "../etc/passwd", Utc::now()),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryObjectStore::new("http://objects.local", b"k".to_vec());
        assert!(store.get("a/b").await.unwrap().is_none());

        store.put("a/b", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(store.get("a/b").await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(store.head("a/b").await.unwrap().unwrap().size, 5);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_create_memory_store_from_config() {
        let config = StorageConfig {
            backend: StorageBackendKind::Memory,
            signing_key: "literal-key".to_string(),
            ..Default::default()
        };
        assert!(create_object_store(&config).is_ok());

        let missing = StorageConfig {
            backend: StorageBackendKind::Memory,
            signing_key: "env:CORDON_TEST_SIGNING_KEY_THAT_IS_NOT_SET".to_string(),
            ..Default::default()
        };
        assert!(create_object_store(&missing).is_err());
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Workload Launcher
//!
//! Capability abstraction for starting, observing and tearing down the
//! isolated compute unit that runs one agent execution. The orchestrator only
//! depends on [`WorkloadLauncher`]; whether the unit is a local container or a
//! managed cluster job is decided once at startup.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Launch contract, job specification and opaque execution handle

use crate::domain::execution::ExecutionId;
use crate::domain::service_account::ServiceAccountId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Prefix of every compute unit name created by the orchestrator
pub const WORKLOAD_NAME_PREFIX: &str = "cordon-exec-";

/// Deterministic compute unit name for an execution.
///
/// Retried launches resolve to the same name, so a duplicate is detected by
/// the backend instead of silently created.
pub fn workload_name(execution_id: ExecutionId) -> String {
    format!("{}{}", WORKLOAD_NAME_PREFIX, execution_id.0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_millis: Option<u32>,
    pub memory_bytes: Option<u64>,
}

/// Immutable description of what to launch.
///
/// Built fresh for every launch attempt and never persisted. Environment
/// values may carry secrets, so `Debug` prints only the variable names.
#[derive(Clone, PartialEq, Eq)]
pub struct JobSpec {
    name: String,
    image: String,
    tag: String,
    env: BTreeMap<String, String>,
    template_vars: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    resources: ResourceLimits,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            tag: tag.into(),
            env: BTreeMap::new(),
            template_vars: BTreeMap::new(),
            labels: BTreeMap::new(),
            resources: ResourceLimits::default(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_template_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.template_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Full image reference. Digest-pinned images are used verbatim.
    pub fn image_reference(&self) -> String {
        if self.image.contains('@') || self.tag.is_empty() {
            self.image.clone()
        } else {
            format!("{}:{}", self.image, self.tag)
        }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Environment rendered as `KEY=VALUE` pairs
    pub fn env_pairs(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    pub fn template_vars(&self) -> &BTreeMap<String, String> {
        &self.template_vars
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn resources(&self) -> &ResourceLimits {
        &self.resources
    }
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("name", &self.name)
            .field("image", &self.image_reference())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("template_vars", &self.template_vars.keys().collect::<Vec<_>>())
            .field("labels", &self.labels)
            .field("resources", &self.resources)
            .finish()
    }
}

/// Which backend produced a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherBackend {
    Docker,
    Kubernetes,
}

impl LauncherBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            LauncherBackend::Docker => "docker",
            LauncherBackend::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for LauncherBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to a launched compute unit.
///
/// Passed verbatim between orchestration steps (and persisted in the
/// checkpoint); only the launcher that created it interprets `name` and
/// `backend_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub backend: LauncherBackend,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_id: Option<ServiceAccountId>,
}

impl ExecutionHandle {
    pub fn new(backend: LauncherBackend, name: impl Into<String>) -> Self {
        Self {
            backend,
            name: name.into(),
            backend_id: None,
            service_account_id: None,
        }
    }

    pub fn with_backend_id(mut self, id: impl Into<String>) -> Self {
        self.backend_id = Some(id.into());
        self
    }

    pub fn with_service_account(mut self, id: ServiceAccountId) -> Self {
        self.service_account_id = Some(id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadState {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub state: WorkloadState,
    pub exit_code: Option<i64>,
    pub reason: Option<String>,
}

impl WorkloadStatus {
    pub fn running() -> Self {
        Self { state: WorkloadState::Running, exit_code: None, reason: None }
    }

    pub fn completed(exit_code: Option<i64>) -> Self {
        Self { state: WorkloadState::Completed, exit_code, reason: None }
    }

    pub fn failed(exit_code: Option<i64>, reason: impl Into<String>) -> Self {
        Self {
            state: WorkloadState::Failed,
            exit_code,
            reason: Some(reason.into()),
        }
    }

    /// A unit the backend does not know about is reported as failed
    pub fn not_found(name: &str) -> Self {
        Self::failed(None, format!("compute unit {} not found", name))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The platform refused the specification (bad image, quota, invalid definition)
    #[error("Launch rejected: {0}")]
    Rejected(String),
    /// The platform could not be reached; safe to retry
    #[error("Launcher backend unavailable: {0}")]
    Unavailable(String),
    #[error("Handle was created by the {actual} launcher, not {expected}")]
    BackendMismatch {
        expected: LauncherBackend,
        actual: LauncherBackend,
    },
}

impl LaunchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LaunchError::Unavailable(_))
    }
}

/// Best-effort teardown failure. Logged by the orchestrator, never escalated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CleanupError {
    #[error("Failed to tear down {name}: {reason}")]
    TeardownFailed { name: String, reason: String },
    #[error("Failed to revoke service account: {0}")]
    RevocationFailed(String),
    #[error("Handle was created by the {actual} launcher, not {expected}")]
    BackendMismatch {
        expected: LauncherBackend,
        actual: LauncherBackend,
    },
}

#[async_trait]
pub trait WorkloadLauncher: Send + Sync {
    fn backend(&self) -> LauncherBackend;

    /// Start exactly one compute unit for `spec`. Returns without waiting for it.
    async fn launch(&self, spec: JobSpec) -> Result<ExecutionHandle, LaunchError>;

    /// Side-effect free status read. Unknown units map to `failed`.
    async fn check_status(&self, handle: &ExecutionHandle) -> Result<WorkloadStatus, LaunchError>;

    /// Idempotent teardown. Absent units are success.
    async fn cleanup(&self, handle: &ExecutionHandle) -> Result<(), CleanupError>;
}

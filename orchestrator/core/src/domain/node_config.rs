// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Orchestrator Configuration Types
//
// Defines the configuration schema for a Cordon orchestrator process:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Launcher backend selection (docker or kubernetes) and agent images
// - Durable orchestration tuning (poll interval, wait budget, worker pool, retries)
// - Object storage (local or memory) and database connections
// - Logging and metrics settings

use crate::domain::execution::ExecutionKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "cordon.dev/v1";
pub const KIND: &str = "OrchestratorConfig";

/// Top-level Kubernetes-style orchestrator configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfigManifest {
    /// API version (must be "cordon.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "OrchestratorConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: OrchestratorConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable orchestrator name, also used as the worker id prefix
    pub name: String,
}

/// Configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfigSpec {
    #[serde(default)]
    pub launcher: LauncherConfig,

    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Omitted means in-memory repositories (development only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherBackendKind {
    Docker,
    Kubernetes,
}

impl LauncherBackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "docker" => Some(Self::Docker),
            "kubernetes" | "k8s" => Some(Self::Kubernetes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Selected once at process start; every execution uses the same backend
    #[serde(default = "default_backend")]
    pub backend: LauncherBackendKind,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesConfig>,

    #[serde(default)]
    pub images: AgentImages,

    #[serde(default)]
    pub resources: ResourceConfig,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            docker: DockerConfig::default(),
            kubernetes: None,
            images: AgentImages::default(),
            resources: ResourceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Path to Docker socket. Default: bollard's local defaults
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,

    /// Network the agent containers join (must reach the platform API)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,

    /// Pull the image when it is not present locally
    #[serde(default = "default_true")]
    pub autopull: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            network_mode: None,
            autopull: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// API server base URL
    #[serde(default = "default_k8s_api_server")]
    pub api_server: String,

    #[serde(default = "default_k8s_namespace")]
    pub namespace: String,

    /// Bearer token file (in-cluster service account token by default)
    #[serde(default = "default_k8s_token_path")]
    pub token_path: String,

    /// CA bundle for the API server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<String>,

    /// Handlebars Job template. Default: the built-in template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_template_path: Option<String>,

    #[serde(default = "default_ttl_after_finished")]
    pub ttl_seconds_after_finished: u32,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: default_k8s_api_server(),
            namespace: default_k8s_namespace(),
            token_path: default_k8s_token_path(),
            ca_cert_path: None,
            job_template_path: None,
            ttl_seconds_after_finished: default_ttl_after_finished(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub image: String,
    #[serde(default = "default_image_tag")]
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentImages {
    #[serde(default = "default_workflow_image")]
    pub workflow: ImageRef,
    #[serde(default = "default_qa_image")]
    pub question_answering: ImageRef,
}

impl AgentImages {
    pub fn for_kind(&self, kind: ExecutionKind) -> &ImageRef {
        match kind {
            ExecutionKind::Workflow => &self.workflow,
            ExecutionKind::QuestionAnswering => &self.question_answering,
        }
    }
}

impl Default for AgentImages {
    fn default() -> Self {
        Self {
            workflow: default_workflow_image(),
            question_answering: default_qa_image(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_cpu_millis")]
    pub cpu_millis: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_millis: default_cpu_millis(),
            memory_mb: default_memory_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Durable timer between status checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Total wait budget before an execution times out
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,

    /// Number of worker tasks claiming checkpoints
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Checkpoints claimed per worker per round
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a claimed checkpoint stays leased to a worker
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    /// Sleep between empty claim rounds
    #[serde(default = "default_idle_backoff")]
    pub idle_backoff_ms: u64,

    /// Lifetime of the presigned manifest upload URL handed to the agent
    #[serde(default = "default_upload_url_ttl")]
    pub upload_url_ttl_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl OrchestrationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_wait_secs: default_max_wait(),
            workers: default_workers(),
            batch_size: default_batch_size(),
            lease_secs: default_lease(),
            idle_backoff_ms: default_idle_backoff(),
            upload_url_ttl_secs: default_upload_url_ttl(),
            retry: RetryConfig::default(),
        }
    }
}

/// Activity retry policy for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per step, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Local,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackendKind,

    /// Root directory for the local backend
    #[serde(default = "default_storage_path")]
    pub path: String,

    /// Base URL agents upload to with presigned URLs
    #[serde(default = "default_upload_base_url")]
    pub upload_base_url: String,

    /// HMAC key for presigned URLs (supports "env:VAR_NAME")
    #[serde(default = "default_signing_key")]
    pub signing_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
            upload_base_url: default_upload_base_url(),
            signing_key: default_signing_key(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL (supports "env:VAR_NAME")
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Platform API endpoint agents call back into
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Extra environment variables passed to every agent
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus exporter port; disabled when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_backend() -> LauncherBackendKind {
    LauncherBackendKind::Docker
}

fn default_k8s_api_server() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_k8s_namespace() -> String {
    "cordon-agents".to_string()
}

fn default_k8s_token_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}

fn default_ttl_after_finished() -> u32 {
    3600
}

fn default_request_timeout() -> u64 {
    30
}

fn default_image_tag() -> String {
    "latest".to_string()
}

fn default_workflow_image() -> ImageRef {
    ImageRef {
        image: "ghcr.io/cordon-dev/workflow-agent".to_string(),
        tag: default_image_tag(),
    }
}

fn default_qa_image() -> ImageRef {
    ImageRef {
        image: "ghcr.io/cordon-dev/qa-agent".to_string(),
        tag: default_image_tag(),
    }
}

fn default_cpu_millis() -> u32 {
    1000
}

fn default_memory_mb() -> u64 {
    2048
}

fn default_poll_interval() -> u64 {
    10
}

fn default_max_wait() -> u64 {
    1800
}

fn default_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    8
}

fn default_lease() -> u64 {
    120
}

fn default_idle_backoff() -> u64 {
    500
}

fn default_upload_url_ttl() -> u64 {
    // outlives the default wait budget
    7200
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_storage_backend() -> StorageBackendKind {
    StorageBackendKind::Local
}

fn default_storage_path() -> String {
    "/var/lib/cordon/objects".to_string()
}

fn default_upload_base_url() -> String {
    "http://localhost:8000/v1/objects".to_string()
}

fn default_signing_key() -> String {
    "env:CORDON_SIGNING_KEY".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_api_endpoint() -> String {
    "http://host.docker.internal:8000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Resolve a config value of the form `env:VAR_NAME` against the environment.
///
/// Plain values are returned unchanged.
pub fn resolve_env_value(value: &str) -> anyhow::Result<String> {
    match value.strip_prefix("env:") {
        Some(var) => std::env::var(var)
            .map_err(|_| anyhow::anyhow!("Environment variable {} is not set", var)),
        None => Ok(value.to_string()),
    }
}

impl Default for OrchestratorConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "cordon-orchestrator".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
            },
            spec: OrchestratorConfigSpec::default(),
        }
    }
}

impl OrchestratorConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. ./cordon-config.yaml (working directory)
    /// 2. ~/.cordon/config.yaml (user home)
    /// 3. /etc/cordon/config.yaml (system)
    ///
    /// `CORDON_CONFIG_PATH` arrives through the CLI's `--config` flag.
    fn discover_config() -> Option<PathBuf> {
        let cwd = PathBuf::from("./cordon-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".cordon").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/cordon/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CORDON_LAUNCHER_BACKEND") {
            match LauncherBackendKind::parse(&val) {
                Some(backend) => {
                    tracing::info!("Environment override: CORDON_LAUNCHER_BACKEND={}", val);
                    self.spec.launcher.backend = backend;
                }
                None => {
                    tracing::warn!(
                        "Invalid value for CORDON_LAUNCHER_BACKEND: '{}'. Expected docker/kubernetes. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(url) = std::env::var("CORDON_DATABASE_URL") {
            tracing::info!("Environment override: CORDON_DATABASE_URL");
            match self.spec.database.as_mut() {
                Some(db) => db.url = url,
                None => {
                    self.spec.database = Some(DatabaseConfig {
                        url,
                        max_connections: default_max_connections(),
                        run_migrations: true,
                    })
                }
            }
        }

        if let Ok(path) = std::env::var("CORDON_STORAGE_PATH") {
            tracing::info!("Environment override: CORDON_STORAGE_PATH={}", path);
            self.spec.storage.path = path;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let orchestration = &self.spec.orchestration;
        if orchestration.poll_interval_secs == 0 {
            anyhow::bail!("spec.orchestration.poll_interval_secs must be greater than zero");
        }
        if orchestration.max_wait_secs < orchestration.poll_interval_secs {
            anyhow::bail!(
                "spec.orchestration.max_wait_secs ({}) must be at least poll_interval_secs ({})",
                orchestration.max_wait_secs,
                orchestration.poll_interval_secs
            );
        }
        if orchestration.workers == 0 || orchestration.batch_size == 0 {
            anyhow::bail!("spec.orchestration.workers and batch_size must be greater than zero");
        }
        if orchestration.lease_secs == 0 {
            anyhow::bail!("spec.orchestration.lease_secs must be greater than zero");
        }
        if orchestration.retry.max_attempts == 0 {
            anyhow::bail!("spec.orchestration.retry.max_attempts must be at least 1");
        }
        if orchestration.retry.backoff_multiplier < 1.0 {
            anyhow::bail!("spec.orchestration.retry.backoff_multiplier must be >= 1.0");
        }

        let launcher = &self.spec.launcher;
        if launcher.backend == LauncherBackendKind::Kubernetes && launcher.kubernetes.is_none() {
            anyhow::bail!("spec.launcher.kubernetes is required when backend is 'kubernetes'");
        }
        for (kind, image) in [
            (ExecutionKind::Workflow, &launcher.images.workflow),
            (ExecutionKind::QuestionAnswering, &launcher.images.question_answering),
        ] {
            if image.image.is_empty() {
                anyhow::bail!("spec.launcher.images.{}.image cannot be empty", kind);
            }
        }

        let storage = &self.spec.storage;
        if storage.backend == StorageBackendKind::Local && storage.path.is_empty() {
            anyhow::bail!("spec.storage.path cannot be empty for the local backend");
        }

        if let Some(db) = &self.spec.database {
            if db.url.is_empty() {
                anyhow::bail!("spec.database.url cannot be empty");
            }
        }

        if self.spec.agent.api_endpoint.is_empty() {
            anyhow::bail!("spec.agent.api_endpoint cannot be empty");
        }

        match self.spec.observability.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("Invalid log_format '{}'. Must be 'json' or 'text'", other),
        }

        Ok(())
    }
}

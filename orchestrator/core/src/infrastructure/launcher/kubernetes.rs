// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Kubernetes Job launcher
//!
//! Renders a `batch/v1` Job from a Handlebars template and drives it through
//! the API server's REST interface.
//!
//! # API Endpoints
//!
//! - `POST /apis/batch/v1/namespaces/{ns}/jobs` - Create (409 adopts the existing Job)
//! - `GET /apis/batch/v1/namespaces/{ns}/jobs/{name}` - Status
//! - `GET /api/v1/namespaces/{ns}/pods?labelSelector=job-name={name}` - Exit code
//! - `DELETE /apis/batch/v1/namespaces/{ns}/jobs/{name}?propagationPolicy=Background`
//!
//! The template receives `name`, `namespace`, `image`, `labels`, `env` (as a
//! list of `{name, value}`), `resources`, `ttl_seconds_after_finished` and the
//! spec's template variables under `vars`.

use std::collections::BTreeMap;
use std::time::Duration;
use async_trait::async_trait;
use handlebars::{handlebars_helper, Handlebars};
use reqwest::{Certificate, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use crate::domain::launcher::{
    CleanupError, ExecutionHandle, JobSpec, LaunchError, LauncherBackend, WorkloadLauncher,
    WorkloadStatus,
};
use crate::domain::node_config::KubernetesConfig;

const DEFAULT_JOB_TEMPLATE: &str = include_str!("../../../templates/job.yaml.hbs");
const JOB_TEMPLATE_NAME: &str = "job";

handlebars_helper!(json_literal: |v: Json| serde_json::to_string(v).unwrap_or_default());

#[derive(Debug, Serialize)]
struct EnvVar<'a> {
    name: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct JobTemplateContext<'a> {
    name: &'a str,
    namespace: &'a str,
    image: String,
    labels: &'a BTreeMap<String, String>,
    env: Vec<EnvVar<'a>>,
    resources: serde_json::Value,
    ttl_seconds_after_finished: u32,
    vars: &'a BTreeMap<String, String>,
}

pub struct KubernetesJobLauncher {
    client: Client,
    api_server: String,
    namespace: String,
    token: Option<String>,
    templates: Handlebars<'static>,
    ttl_seconds_after_finished: u32,
}

impl KubernetesJobLauncher {
    pub fn from_config(config: &KubernetesConfig) -> Result<Self, LaunchError> {
        let mut builder = Client::builder().timeout(Duration::from_secs(config.request_timeout_secs));
        if let Some(ca_path) = &config.ca_cert_path {
            let pem = std::fs::read(ca_path)
                .map_err(|e| LaunchError::Unavailable(format!("Failed to read CA bundle {}: {}", ca_path, e)))?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| LaunchError::Unavailable(format!("Invalid CA bundle {}: {}", ca_path, e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| LaunchError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        let token = match std::fs::read_to_string(&config.token_path) {
            Ok(token) => Some(token.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %config.token_path, "No Kubernetes token file, calling the API server unauthenticated");
                None
            }
            Err(e) => {
                return Err(LaunchError::Unavailable(format!(
                    "Failed to read Kubernetes token {}: {}",
                    config.token_path, e
                )))
            }
        };

        let template = match &config.job_template_path {
            Some(path) => std::fs::read_to_string(path)
                .map_err(|e| LaunchError::Rejected(format!("Failed to read Job template {}: {}", path, e)))?,
            None => DEFAULT_JOB_TEMPLATE.to_string(),
        };

        Self::new(
            client,
            config.api_server.clone(),
            config.namespace.clone(),
            token,
            &template,
            config.ttl_seconds_after_finished,
        )
    }

    pub fn new(
        client: Client,
        api_server: impl Into<String>,
        namespace: impl Into<String>,
        token: Option<String>,
        template: &str,
        ttl_seconds_after_finished: u32,
    ) -> Result<Self, LaunchError> {
        let mut templates = Handlebars::new();
        templates.set_strict_mode(true);
        templates.register_escape_fn(handlebars::no_escape);
        templates.register_helper("json", Box::new(json_literal));
        templates
            .register_template_string(JOB_TEMPLATE_NAME, template)
            .map_err(|e| LaunchError::Rejected(format!("Invalid Job template: {}", e)))?;

        Ok(Self {
            client,
            api_server: api_server.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            token,
            templates,
            ttl_seconds_after_finished,
        })
    }

    /// Render the Job definition for `spec` as a JSON document
    pub fn render(&self, spec: &JobSpec) -> Result<serde_json::Value, LaunchError> {
        let mut limits = serde_json::Map::new();
        if let Some(cpu) = spec.resources().cpu_millis {
            limits.insert("cpu".into(), format!("{}m", cpu).into());
        }
        if let Some(memory) = spec.resources().memory_bytes {
            limits.insert("memory".into(), memory.to_string().into());
        }
        let resources = if limits.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::json!({ "limits": limits, "requests": limits })
        };

        let context = JobTemplateContext {
            name: spec.name(),
            namespace: &self.namespace,
            image: spec.image_reference(),
            labels: spec.labels(),
            env: spec
                .env()
                .iter()
                .map(|(name, value)| EnvVar { name, value })
                .collect(),
            resources,
            ttl_seconds_after_finished: self.ttl_seconds_after_finished,
            vars: spec.template_vars(),
        };

        let rendered = self
            .templates
            .render(JOB_TEMPLATE_NAME, &context)
            .map_err(|e| LaunchError::Rejected(format!("Failed to render Job template: {}", e)))?;
        serde_yaml::from_str(&rendered)
            .map_err(|e| LaunchError::Rejected(format!("Rendered Job is not valid YAML: {}", e)))
    }

    fn jobs_url(&self) -> String {
        format!("{}/apis/batch/v1/namespaces/{}/jobs", self.api_server, self.namespace)
    }

    fn job_url(&self, name: &str) -> String {
        format!("{}/{}", self.jobs_url(), name)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>, LaunchError> {
        let response = self
            .authorized(self.client.get(self.job_url(name)))
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::OK => response
                .json::<Job>()
                .await
                .map(Some)
                .map_err(|e| LaunchError::Unavailable(format!("Malformed Job from API server: {}", e))),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(api_error(response).await),
        }
    }

    /// Exit code of the Job's agent container, if a pod has terminated
    async fn exit_code(&self, name: &str) -> Option<i64> {
        let url = format!("{}/api/v1/namespaces/{}/pods", self.api_server, self.namespace);
        let response = self
            .authorized(self.client.get(url))
            .query(&[("labelSelector", format!("job-name={}", name))])
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let pods: PodList = response.json().await.ok()?;
        pods.items
            .iter()
            .flat_map(|pod| pod.status.container_statuses.iter())
            .find_map(|cs| cs.state.terminated.as_ref().map(|t| t.exit_code))
    }
}

#[async_trait]
impl WorkloadLauncher for KubernetesJobLauncher {
    fn backend(&self) -> LauncherBackend {
        LauncherBackend::Kubernetes
    }

    async fn launch(&self, spec: JobSpec) -> Result<ExecutionHandle, LaunchError> {
        let body = self.render(&spec)?;

        let response = self
            .authorized(self.client.post(self.jobs_url()))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let job = match response.status() {
            StatusCode::CREATED | StatusCode::OK | StatusCode::ACCEPTED => {
                info!(job = %spec.name(), namespace = %self.namespace, "Created agent Job");
                response.json::<Job>().await.ok()
            }
            StatusCode::CONFLICT => {
                warn!(job = %spec.name(), "Job already exists, adopting it");
                self.get_job(spec.name()).await?
            }
            _ => return Err(api_error(response).await),
        };

        let mut handle = ExecutionHandle::new(LauncherBackend::Kubernetes, spec.name());
        if let Some(uid) = job.and_then(|j| j.metadata.uid) {
            handle = handle.with_backend_id(uid);
        }
        Ok(handle)
    }

    async fn check_status(&self, handle: &ExecutionHandle) -> Result<WorkloadStatus, LaunchError> {
        if handle.backend != LauncherBackend::Kubernetes {
            return Err(LaunchError::BackendMismatch {
                expected: LauncherBackend::Kubernetes,
                actual: handle.backend,
            });
        }

        let Some(job) = self.get_job(&handle.name).await? else {
            return Ok(WorkloadStatus::not_found(&handle.name));
        };

        match job.status.phase() {
            JobPhase::Running => Ok(WorkloadStatus::running()),
            JobPhase::Succeeded => Ok(WorkloadStatus::completed(self.exit_code(&handle.name).await.or(Some(0)))),
            JobPhase::Failed(reason) => {
                let exit_code = self.exit_code(&handle.name).await;
                Ok(WorkloadStatus::failed(exit_code, reason))
            }
        }
    }

    async fn cleanup(&self, handle: &ExecutionHandle) -> Result<(), CleanupError> {
        if handle.backend != LauncherBackend::Kubernetes {
            return Err(CleanupError::BackendMismatch {
                expected: LauncherBackend::Kubernetes,
                actual: handle.backend,
            });
        }

        let response = self
            .authorized(self.client.delete(self.job_url(&handle.name)))
            .query(&[("propagationPolicy", "Background")])
            .send()
            .await
            .map_err(|e| CleanupError::TeardownFailed {
                name: handle.name.clone(),
                reason: e.to_string(),
            })?;

        match response.status() {
            s if s.is_success() => {
                info!(job = %handle.name, "Deleted agent Job");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!(job = %handle.name, "Job already gone");
                Ok(())
            }
            _ => Err(CleanupError::TeardownFailed {
                name: handle.name.clone(),
                reason: api_error(response).await.to_string(),
            }),
        }
    }
}

fn transport(err: reqwest::Error) -> LaunchError {
    LaunchError::Unavailable(err.to_string())
}

/// Map a non-success API response. Refusals of the definition are permanent.
async fn api_error(response: reqwest::Response) -> LaunchError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiStatus>(&text)
        .ok()
        .and_then(|s| s.message)
        .unwrap_or(text);
    let detail = format!("{} ({})", message, status);

    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::UNPROCESSABLE_ENTITY => LaunchError::Rejected(detail),
        _ => LaunchError::Unavailable(detail),
    }
}

// ============================================================================
// Kubernetes API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiStatus {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Job {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: JobStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    uid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct JobStatus {
    #[serde(default)]
    succeeded: u32,
    #[serde(default)]
    failed: u32,
    #[serde(default)]
    conditions: Vec<JobCondition>,
}

#[derive(Debug, Deserialize)]
struct JobCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
    reason: Option<String>,
    message: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum JobPhase {
    Running,
    Succeeded,
    Failed(String),
}

impl JobStatus {
    fn phase(&self) -> JobPhase {
        let active = |kind: &str| {
            self.conditions
                .iter()
                .find(|c| c.kind == kind && c.status == "True")
        };

        if let Some(c) = active("Failed").or_else(|| active("FailureTarget")) {
            let reason = match (&c.reason, &c.message) {
                (Some(r), Some(m)) => format!("{}: {}", r, m),
                (Some(r), None) => r.clone(),
                (None, Some(m)) => m.clone(),
                (None, None) => "Job failed".to_string(),
            };
            return JobPhase::Failed(reason);
        }
        if active("Complete").is_some() || self.succeeded > 0 {
            return JobPhase::Succeeded;
        }
        if self.failed > 0 {
            return JobPhase::Failed(format!("{} pod(s) failed", self.failed));
        }
        JobPhase::Running
    }
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    #[serde(default)]
    state: ContainerStateInfo,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerStateInfo {
    terminated: Option<Terminated>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Terminated {
    exit_code: i64,
}

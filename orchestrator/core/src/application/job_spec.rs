// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Job Specification Builder
//!
//! Turns an execution's task and freshly issued credential into the
//! [`JobSpec`] handed to the launcher. Everything the agent needs to find its
//! way back to the platform travels as environment variables:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `CORDON_EXECUTION_ID` | execution uuid |
//! | `CORDON_EXECUTION_KIND` | `workflow` or `question_answering` |
//! | `CORDON_TENANT_ID` | tenant uuid |
//! | `CORDON_PARENT_JOB_ID` | workflow / QA job uuid |
//! | `CORDON_API_ENDPOINT` | platform API base URL |
//! | `CORDON_API_KEY` | one-time service account credential |
//! | `CORDON_OUTPUT_PREFIX` | object key prefix for output uploads |
//! | `CORDON_OUTPUT_UPLOAD_URL` | presigned PUT grant for that prefix; append the file name to its path |
//! | `CORDON_MANIFEST_KEY` | object key of the completion manifest |
//! | `CORDON_MANIFEST_UPLOAD_URL` | presigned PUT URL for the manifest |
//! | `CORDON_TASK` | opaque task parameters as JSON |

use crate::domain::checkpoint::ExecutionTask;
use crate::domain::execution::ExecutionId;
use crate::domain::launcher::{workload_name, JobSpec, ResourceLimits};
use crate::domain::manifest::ExecutionPaths;
use crate::domain::node_config::{AgentImages, ResourceConfig};
use crate::domain::service_account::ApiCredential;
use crate::domain::storage::{ObjectStore, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const ENV_EXECUTION_ID: &str = "CORDON_EXECUTION_ID";
pub const ENV_EXECUTION_KIND: &str = "CORDON_EXECUTION_KIND";
pub const ENV_TENANT_ID: &str = "CORDON_TENANT_ID";
pub const ENV_PARENT_JOB_ID: &str = "CORDON_PARENT_JOB_ID";
pub const ENV_API_ENDPOINT: &str = "CORDON_API_ENDPOINT";
pub const ENV_API_KEY: &str = "CORDON_API_KEY";
pub const ENV_OUTPUT_PREFIX: &str = "CORDON_OUTPUT_PREFIX";
pub const ENV_OUTPUT_UPLOAD_URL: &str = "CORDON_OUTPUT_UPLOAD_URL";
pub const ENV_MANIFEST_KEY: &str = "CORDON_MANIFEST_KEY";
pub const ENV_MANIFEST_UPLOAD_URL: &str = "CORDON_MANIFEST_UPLOAD_URL";
pub const ENV_TASK: &str = "CORDON_TASK";

pub const LABEL_EXECUTION_ID: &str = "cordon.dev/execution-id";
pub const LABEL_TENANT_ID: &str = "cordon.dev/tenant-id";
pub const LABEL_KIND: &str = "cordon.dev/kind";

pub struct JobSpecBuilder {
    images: AgentImages,
    resources: ResourceConfig,
    api_endpoint: String,
    extra_env: HashMap<String, String>,
    object_store: Arc<dyn ObjectStore>,
    upload_url_ttl: Duration,
}

impl JobSpecBuilder {
    pub fn new(
        images: AgentImages,
        resources: ResourceConfig,
        api_endpoint: impl Into<String>,
        object_store: Arc<dyn ObjectStore>,
        upload_url_ttl: Duration,
    ) -> Self {
        Self {
            images,
            resources,
            api_endpoint: api_endpoint.into(),
            extra_env: HashMap::new(),
            object_store,
            upload_url_ttl,
        }
    }

    /// Additional static environment for every agent. Reserved names are ignored.
    pub fn with_extra_env(mut self, env: HashMap<String, String>) -> Self {
        self.extra_env = env;
        self
    }

    pub async fn build(
        &self,
        execution_id: ExecutionId,
        task: &ExecutionTask,
        credential: &ApiCredential,
    ) -> Result<JobSpec, StorageError> {
        let paths = ExecutionPaths::new(task.tenant_id, task.parent_job_id, execution_id);
        let manifest_key = paths.manifest_key();
        let upload_url = self
            .object_store
            .presign_put(&manifest_key, self.upload_url_ttl)
            .await?;
        let outputs_prefix = paths.outputs_prefix();
        let outputs_url = self
            .object_store
            .presign_prefix_put(outputs_prefix.trim_end_matches('/'), self.upload_url_ttl)
            .await?;

        let image = self.images.for_kind(task.kind);
        let task_json = serde_json::to_string(&task.parameters)
            .map_err(|e| StorageError::Unknown(format!("task parameters are not serializable: {}", e)))?;

        let mut spec = JobSpec::new(workload_name(execution_id), &image.image, &image.tag);

        for (key, value) in &self.extra_env {
            if key.starts_with("CORDON_") {
                tracing::warn!("Ignoring reserved agent env override: {}", key);
                continue;
            }
            spec = spec.with_env(key, value);
        }

        spec = spec
            .with_env(ENV_EXECUTION_ID, execution_id.to_string())
            .with_env(ENV_EXECUTION_KIND, task.kind.as_str())
            .with_env(ENV_TENANT_ID, task.tenant_id.to_string())
            .with_env(ENV_PARENT_JOB_ID, task.parent_job_id.to_string())
            .with_env(ENV_API_ENDPOINT, &self.api_endpoint)
            .with_env(ENV_API_KEY, credential.expose())
            .with_env(ENV_OUTPUT_PREFIX, &outputs_prefix)
            .with_env(ENV_OUTPUT_UPLOAD_URL, outputs_url)
            .with_env(ENV_MANIFEST_KEY, &manifest_key)
            .with_env(ENV_MANIFEST_UPLOAD_URL, upload_url)
            .with_env(ENV_TASK, task_json)
            .with_label(LABEL_EXECUTION_ID, execution_id.to_string())
            .with_label(LABEL_TENANT_ID, task.tenant_id.to_string())
            .with_label(LABEL_KIND, task.kind.as_str())
            .with_template_var("execution_id", execution_id.to_string())
            .with_template_var("tenant_id", task.tenant_id.to_string())
            .with_template_var("parent_job_id", task.parent_job_id.to_string())
            .with_template_var("kind", task.kind.as_str())
            .with_template_var("cpu_millis", self.resources.cpu_millis.to_string())
            .with_template_var("memory_mb", self.resources.memory_mb.to_string())
            .with_resources(ResourceLimits {
                cpu_millis: Some(self.resources.cpu_millis),
                memory_bytes: Some(self.resources.memory_mb * 1024 * 1024),
            });

        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::execution::{ExecutionKind, ParentJobId, TenantId, UserId};
    use crate::infrastructure::storage::{InMemoryObjectStore, UrlSigner};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_build_injects_agent_contract() {
        let store = Arc::new(InMemoryObjectStore::new("http://objects.local", b"k".to_vec()));
        let builder = JobSpecBuilder::new(
            AgentImages::default(),
            ResourceConfig::default(),
            "http://api.local",
            store,
            Duration::from_secs(60),
        )
        .with_extra_env(HashMap::from([
            ("HTTP_PROXY".to_string(), "http://proxy:3128".to_string()),
            ("CORDON_API_KEY".to_string(), "hijack".to_string()),
        ]));

        let execution_id = ExecutionId::new();
        let task = ExecutionTask {
            kind: ExecutionKind::QuestionAnswering,
            parent_job_id: ParentJobId(Uuid::new_v4()),
            tenant_id: TenantId::new(),
            user_id: UserId(Uuid::new_v4()),
            parameters: serde_json::json!({"question_id": Uuid::nil()}),
        };

        let spec = builder
            .build(execution_id, &task, &ApiCredential::new("cx_secret"))
            .await
            .unwrap();

        assert_eq!(spec.name(), workload_name(execution_id));
        assert_eq!(spec.image(), AgentImages::default().question_answering.image);
        assert_eq!(spec.env()[ENV_API_KEY], "cx_secret");
        assert_eq!(spec.env()[ENV_EXECUTION_KIND], "question_answering");
        assert_eq!(spec.env()["HTTP_PROXY"], "http://proxy:3128");
        assert!(spec.env()[ENV_MANIFEST_KEY].ends_with("/.manifest.json"));
        assert!(spec.env()[ENV_MANIFEST_UPLOAD_URL].starts_with("http://objects.local/"));
        assert!(spec.env()[ENV_OUTPUT_PREFIX].ends_with("/outputs/"));

        // the outputs grant admits files under the prefix and nothing else
        let signer = UrlSigner::new("http://objects.local", b"k".to_vec());
        let (path, query) = spec.env()[ENV_OUTPUT_UPLOAD_URL].split_once('?').unwrap();
        let key = signer
            .authorize("PUT", &format!("{}table.csv?{}", path, query), chrono::Utc::now())
            .unwrap();
        assert_eq!(key, format!("{}table.csv", spec.env()[ENV_OUTPUT_PREFIX]));
        let manifest_via_grant = format!("{}?{}", path.replace("/outputs/", "/.manifest.json"), query);
        assert!(signer.authorize("PUT", &manifest_via_grant, chrono::Utc::now()).is_err());

        let task_back: serde_json::Value = serde_json::from_str(&spec.env()[ENV_TASK]).unwrap();
        assert_eq!(task_back, task.parameters);
        assert_eq!(spec.labels()[LABEL_EXECUTION_ID], execution_id.to_string());
        assert_eq!(spec.resources().memory_bytes, Some(2048 * 1024 * 1024));
    }
}

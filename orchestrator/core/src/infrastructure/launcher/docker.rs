// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Docker launcher
//!
//! One container per execution, named after the execution id. Containers are
//! not auto-removed so the exit code stays readable until cleanup.

use std::collections::HashMap;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerState, ContainerStateStatusEnum, HostConfig};
use futures::StreamExt;
use tracing::{debug, info, warn};
use crate::domain::launcher::{
    CleanupError, ExecutionHandle, JobSpec, LaunchError, LauncherBackend, WorkloadLauncher,
    WorkloadStatus,
};
use crate::domain::node_config::DockerConfig;

const CONNECT_TIMEOUT_SECS: u64 = 120;
const PIDS_LIMIT: i64 = 512;

pub struct DockerLauncher {
    docker: Docker,
    network_mode: Option<String>,
    autopull: bool,
}

impl DockerLauncher {
    pub fn new(config: &DockerConfig) -> Result<Self, LaunchError> {
        let docker = match &config.socket_path {
            Some(path) => {
                #[cfg(unix)]
                let result = Docker::connect_with_unix(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION);

                #[cfg(windows)]
                let result = Docker::connect_with_named_pipe(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION);

                result.map_err(|e| LaunchError::Unavailable(format!(
                    "Failed to connect to Docker at {}: {}",
                    path, e
                )))?
            }
            None => Docker::connect_with_local_defaults()
                .map_err(|e| LaunchError::Unavailable(format!("Failed to connect to Docker: {}", e)))?,
        };

        Ok(Self {
            docker,
            network_mode: config.network_mode.clone(),
            autopull: config.autopull,
        })
    }

    /// Verify the daemon is reachable
    pub async fn healthcheck(&self) -> Result<(), LaunchError> {
        self.docker
            .ping()
            .await
            .map_err(|e| LaunchError::Unavailable(format!("Cannot connect to Docker daemon: {}", e)))?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), LaunchError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if status_code(&e) == Some(404) => {}
            Err(e) => return Err(classify(e)),
        }

        if !self.autopull {
            return Err(LaunchError::Rejected(format!(
                "Image {} not found locally and autopull is disabled",
                image
            )));
        }

        info!(image = %image, "Pulling agent image");
        let options = Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(match classify(e) {
                    LaunchError::Rejected(msg) => LaunchError::Rejected(format!("Failed to pull image {}: {}", image, msg)),
                    other => other,
                });
            }
        }
        info!(image = %image, "Pulled agent image");
        Ok(())
    }

    fn container_config(&self, spec: &JobSpec) -> Config<String> {
        let mut host_config = HostConfig {
            network_mode: self.network_mode.clone(),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            pids_limit: Some(PIDS_LIMIT),
            auto_remove: Some(false),
            ..Default::default()
        };
        if let Some(memory_bytes) = spec.resources().memory_bytes {
            host_config.memory = Some(memory_bytes as i64);
        }
        if let Some(cpu_millis) = spec.resources().cpu_millis {
            // 1 milli CPU = 1e6 nano CPUs
            host_config.nano_cpus = Some((cpu_millis as i64) * 1_000_000);
        }

        let labels: HashMap<String, String> = spec
            .labels()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Config {
            image: Some(spec.image_reference()),
            env: Some(spec.env_pairs()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Adopt a container that already carries this execution's name
    async fn adopt(&self, name: &str) -> Result<String, LaunchError> {
        let existing = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;
        let id = existing.id.unwrap_or_else(|| name.to_string());

        let never_started = matches!(
            existing.state.as_ref().and_then(|s| s.status.as_ref()),
            Some(ContainerStateStatusEnum::CREATED)
        );
        if never_started {
            self.start(&id).await?;
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), LaunchError> {
        match self.docker.start_container(id, None::<StartContainerOptions<String>>).await {
            Ok(()) => Ok(()),
            // already started
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }
}

#[async_trait]
impl WorkloadLauncher for DockerLauncher {
    fn backend(&self) -> LauncherBackend {
        LauncherBackend::Docker
    }

    async fn launch(&self, spec: JobSpec) -> Result<ExecutionHandle, LaunchError> {
        let image = spec.image_reference();
        self.ensure_image(&image).await?;

        let options = CreateContainerOptions {
            name: spec.name().to_string(),
            platform: None,
        };

        let id = match self.docker.create_container(Some(options), self.container_config(&spec)).await {
            Ok(created) => {
                for warning in &created.warnings {
                    debug!(container = %spec.name(), warning = %warning, "Docker create warning");
                }
                self.start(&created.id).await?;
                info!(container = %spec.name(), image = %image, "Launched agent container");
                created.id
            }
            Err(e) if status_code(&e) == Some(409) => {
                warn!(container = %spec.name(), "Container already exists, adopting it");
                self.adopt(spec.name()).await?
            }
            Err(e) => return Err(classify(e)),
        };

        Ok(ExecutionHandle::new(LauncherBackend::Docker, spec.name()).with_backend_id(id))
    }

    async fn check_status(&self, handle: &ExecutionHandle) -> Result<WorkloadStatus, LaunchError> {
        if handle.backend != LauncherBackend::Docker {
            return Err(LaunchError::BackendMismatch {
                expected: LauncherBackend::Docker,
                actual: handle.backend,
            });
        }
        let target = handle.backend_id.as_deref().unwrap_or(&handle.name);

        match self.docker.inspect_container(target, None::<InspectContainerOptions>).await {
            Ok(inspect) => Ok(match inspect.state {
                Some(state) => status_from_state(&handle.name, &state),
                None => WorkloadStatus::running(),
            }),
            Err(e) if status_code(&e) == Some(404) => Ok(WorkloadStatus::not_found(&handle.name)),
            Err(e) => Err(classify(e)),
        }
    }

    async fn cleanup(&self, handle: &ExecutionHandle) -> Result<(), CleanupError> {
        if handle.backend != LauncherBackend::Docker {
            return Err(CleanupError::BackendMismatch {
                expected: LauncherBackend::Docker,
                actual: handle.backend,
            });
        }
        let target = handle.backend_id.as_deref().unwrap_or(&handle.name);
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(target, Some(options)).await {
            Ok(()) => {
                info!(container = %handle.name, "Removed agent container");
                Ok(())
            }
            Err(e) if status_code(&e) == Some(404) => {
                debug!(container = %handle.name, "Container already gone");
                Ok(())
            }
            Err(e) => Err(CleanupError::TeardownFailed {
                name: handle.name.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

fn status_code(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Daemon refusals are permanent; transport and daemon-side failures are not
fn classify(err: DockerError) -> LaunchError {
    match status_code(&err) {
        Some(code) if (400..500).contains(&code) && code != 408 && code != 429 => {
            LaunchError::Rejected(err.to_string())
        }
        _ => LaunchError::Unavailable(err.to_string()),
    }
}

fn status_from_state(name: &str, state: &ContainerState) -> WorkloadStatus {
    match state.status {
        Some(ContainerStateStatusEnum::EXITED) => {
            let exit_code = state.exit_code;
            if state.oom_killed == Some(true) {
                return WorkloadStatus::failed(exit_code, "container was killed: out of memory");
            }
            match exit_code {
                Some(0) => WorkloadStatus::completed(Some(0)),
                Some(code) => WorkloadStatus::failed(Some(code), format!("container exited with code {}", code)),
                None => WorkloadStatus::failed(None, "container exited without an exit code"),
            }
        }
        Some(ContainerStateStatusEnum::DEAD) => WorkloadStatus::failed(
            state.exit_code,
            state
                .error
                .clone()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| format!("container {} is dead", name)),
        ),
        Some(ContainerStateStatusEnum::REMOVING) => {
            WorkloadStatus::failed(state.exit_code, format!("container {} is being removed", name))
        }
        _ => WorkloadStatus::running(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::launcher::WorkloadState;

    fn state(status: ContainerStateStatusEnum, exit_code: Option<i64>) -> ContainerState {
        ContainerState {
            status: Some(status),
            exit_code,
            ..Default::default()
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_from_state("c", &state(ContainerStateStatusEnum::RUNNING, None)).state,
            WorkloadState::Running
        );
        assert_eq!(
            status_from_state("c", &state(ContainerStateStatusEnum::CREATED, None)).state,
            WorkloadState::Running
        );
        assert_eq!(
            status_from_state("c", &state(ContainerStateStatusEnum::EXITED, Some(0))),
            WorkloadStatus::completed(Some(0))
        );

        let failed = status_from_state("c", &state(ContainerStateStatusEnum::EXITED, Some(3)));
        assert_eq!(failed.state, WorkloadState::Failed);
        assert_eq!(failed.exit_code, Some(3));
    }

    #[test]
    fn test_oom_is_failure_even_with_zero_exit() {
        let mut s = state(ContainerStateStatusEnum::EXITED, Some(0));
        s.oom_killed = Some(true);
        let status = status_from_state("c", &s);
        assert_eq!(status.state, WorkloadState::Failed);
        assert!(status.reason.unwrap().contains("out of memory"));
    }

    #[test]
    fn test_error_classification() {
        let rejected = classify(DockerError::DockerResponseServerError {
            status_code: 400,
            message: "invalid reference format".into(),
        });
        assert!(matches!(rejected, LaunchError::Rejected(_)));

        let unavailable = classify(DockerError::DockerResponseServerError {
            status_code: 500,
            message: "daemon busy".into(),
        });
        assert!(unavailable.is_retryable());
    }
}

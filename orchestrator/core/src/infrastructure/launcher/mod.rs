// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Launcher backends
//!
//! Exactly one [`WorkloadLauncher`] is built at process start from
//! `spec.launcher.backend`; nothing downstream branches on the backend.

pub mod docker;
pub mod kubernetes;

pub use docker::DockerLauncher;
pub use kubernetes::KubernetesJobLauncher;

use std::sync::Arc;
use tracing::info;
use crate::domain::launcher::WorkloadLauncher;
use crate::domain::node_config::{LauncherBackendKind, LauncherConfig};

pub fn create_launcher(config: &LauncherConfig) -> anyhow::Result<Arc<dyn WorkloadLauncher>> {
    let launcher: Arc<dyn WorkloadLauncher> = match config.backend {
        LauncherBackendKind::Docker => Arc::new(DockerLauncher::new(&config.docker)?),
        LauncherBackendKind::Kubernetes => {
            let k8s = config
                .kubernetes
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("launcher.backend is kubernetes but launcher.kubernetes is not configured"))?;
            Arc::new(KubernetesJobLauncher::from_config(k8s)?)
        }
    };

    info!(backend = %launcher.backend(), "Workload launcher initialized");
    Ok(launcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kubernetes_requires_settings() {
        let config = LauncherConfig {
            backend: LauncherBackendKind::Kubernetes,
            kubernetes: None,
            ..Default::default()
        };
        assert!(create_launcher(&config).is_err());
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Worker daemon
//!
//! Runs the orchestration worker pool against the configured repositories
//! until SIGINT/SIGTERM. Several daemons can share one database: checkpoint
//! leases keep them from running the same step twice.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cordon_core::domain::node_config::OrchestratorConfigManifest;
use cordon_core::domain::repository::CheckpointRepository;

use crate::embedded::EmbeddedOrchestrator;

#[derive(Args, Debug, Clone)]
pub struct DaemonArgs {
    /// Worker name prefix, used as the checkpoint lease owner
    #[arg(long, env = "CORDON_WORKER_NAME", default_value = "cordon")]
    pub name: String,

    /// Override spec.orchestration.workers
    #[arg(long)]
    pub workers: Option<usize>,
}

pub async fn run(args: DaemonArgs, mut config: OrchestratorConfigManifest) -> Result<()> {
    if let Some(workers) = args.workers {
        config.spec.orchestration.workers = workers;
    }

    if let Some(port) = config.spec.observability.metrics_port {
        install_metrics_exporter(port)?;
    }

    let orchestrator = EmbeddedOrchestrator::new(config).await?;
    if !orchestrator.repositories().persistent {
        warn!("Running without spec.database: only executions started by this process can be orchestrated");
    }

    let unfinished = orchestrator
        .repositories()
        .checkpoints
        .find_unfinished(1000)
        .await
        .context("Failed to list unfinished executions")?;
    if !unfinished.is_empty() {
        info!(count = unfinished.len(), "Resuming unfinished executions");
    }

    let pool = orchestrator.worker_pool(&args.name)?;
    let shutdown = CancellationToken::new();
    let handles = pool.spawn(shutdown.clone());

    println!(
        "{}",
        format!("✓ Cordon daemon running with {} workers", pool.workers().len()).green()
    );
    info!(
        workers = pool.workers().len(),
        backend = orchestrator.config().spec.launcher.backend.as_str(),
        "Orchestration daemon started"
    );

    shutdown_signal().await;
    info!("Shutting down, waiting for in-flight steps to commit");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Worker task panicked: {}", e);
        }
    }

    info!("Orchestration daemon stopped");
    Ok(())
}

fn install_metrics_exporter(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

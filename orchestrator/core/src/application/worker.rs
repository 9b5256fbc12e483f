// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Orchestration Worker Pool
//!
//! Workers repeatedly lease due checkpoints, run one state-machine step on
//! each, and commit the result. While a step runs its lease is renewed every
//! `heartbeat`, so a slow launch is not mistaken for a dead worker. A worker
//! that dies mid-step simply lets its lease expire; whichever worker claims
//! the checkpoint next resumes from the last committed step.
//!
//! # Architecture
//!
//! - **Layer:** Application
//! - **Responsibility:** Durable execution of state-machine steps
//! - **Collaborators:** CheckpointRepository, ExecutionStateMachine, Clock

use crate::application::state_machine::ExecutionStateMachine;
use crate::domain::checkpoint::ExecutionCheckpoint;
use crate::domain::clock::Clock;
use crate::domain::execution::ExecutionId;
use crate::domain::node_config::OrchestrationConfig;
use crate::domain::repository::{CheckpointRepository, RepositoryError};
use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub lease: chrono::Duration,
    pub idle_backoff: std::time::Duration,
    /// Lease renewal period while a step is in flight
    pub heartbeat: std::time::Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &OrchestrationConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            batch_size: config.batch_size.max(1),
            lease: chrono::Duration::seconds(config.lease_secs as i64),
            idle_backoff: std::time::Duration::from_millis(config.idle_backoff_ms),
            heartbeat: std::time::Duration::from_millis(config.lease_secs * 1000 / 3)
                .max(std::time::Duration::from_millis(100)),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&OrchestrationConfig::default())
    }
}

pub struct OrchestrationWorker {
    id: String,
    checkpoints: Arc<dyn CheckpointRepository>,
    machine: Arc<ExecutionStateMachine>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
}

impl OrchestrationWorker {
    pub fn new(
        id: impl Into<String>,
        checkpoints: Arc<dyn CheckpointRepository>,
        machine: Arc<ExecutionStateMachine>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id: id.into(),
            checkpoints,
            machine,
            clock,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim one batch of due checkpoints and advance each by one step.
    ///
    /// Returns how many checkpoints were processed.
    pub async fn run_due(&self) -> Result<usize> {
        let now = self.clock.now();
        let claimed = self
            .checkpoints
            .claim_due(&self.id, now, self.settings.lease, self.settings.batch_size)
            .await
            .context("Failed to claim due checkpoints")?;

        let count = claimed.len();
        if count > 0 {
            debug!(worker = %self.id, count, "Claimed checkpoints");
        }

        // distinct executions, so steps run concurrently
        join_all(claimed.into_iter().map(|cp| self.process(cp))).await;
        Ok(count)
    }

    /// Keep running due steps until nothing is due at the current clock time
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let processed = self.run_due().await?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    async fn process(&self, mut checkpoint: ExecutionCheckpoint) {
        let execution_id = checkpoint.execution_id;
        {
            let step = self.machine.step(&mut checkpoint);
            tokio::pin!(step);
            let period = self.settings.heartbeat;
            let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            let mut renewing = true;
            loop {
                tokio::select! {
                    _ = &mut step => break,
                    _ = heartbeat.tick(), if renewing => {
                        renewing = self.renew_lease(execution_id).await;
                    }
                }
            }
        }

        match self.checkpoints.commit(&checkpoint, &self.id).await {
            Ok(()) => {
                if checkpoint.is_finished() {
                    info!(execution_id = %execution_id, worker = %self.id, "Orchestration finished");
                }
            }
            Err(RepositoryError::Conflict(reason)) => {
                // another worker took over after our lease expired
                warn!(execution_id = %execution_id, worker = %self.id, "Lost checkpoint lease: {}", reason);
            }
            Err(e) => {
                error!(execution_id = %execution_id, worker = %self.id, "Failed to commit checkpoint: {}", e);
            }
        }
    }

    /// Push the lease out by another full period; false once it is gone
    async fn renew_lease(&self, execution_id: ExecutionId) -> bool {
        let now = self.clock.now();
        match self
            .checkpoints
            .renew_lease(execution_id, &self.id, now, now + self.settings.lease)
            .await
        {
            Ok(()) => {
                debug!(execution_id = %execution_id, worker = %self.id, "Lease renewed");
                true
            }
            Err(RepositoryError::Conflict(reason)) => {
                warn!(execution_id = %execution_id, worker = %self.id, "Lease lost mid-step: {}", reason);
                metrics::counter!("cordon_lease_lost_total").increment(1);
                false
            }
            Err(e) => {
                warn!(execution_id = %execution_id, worker = %self.id, "Lease renewal failed: {}", e);
                true
            }
        }
    }

    /// Claim loop with graceful shutdown support
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(worker = %self.id, "Orchestration worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let processed = match self.run_due().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(worker = %self.id, "Claim round failed: {:#}", e);
                    0
                }
            };

            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.idle_backoff) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }

        info!(worker = %self.id, "Orchestration worker stopped");
    }
}

/// Fixed-size set of workers sharing one state machine
pub struct WorkerPool {
    workers: Vec<Arc<OrchestrationWorker>>,
}

impl WorkerPool {
    pub fn new(
        name: &str,
        checkpoints: Arc<dyn CheckpointRepository>,
        machine: Arc<ExecutionStateMachine>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        let workers = (0..settings.workers)
            .map(|i| {
                Arc::new(OrchestrationWorker::new(
                    format!("{}-{}-{}", name, std::process::id(), i),
                    checkpoints.clone(),
                    machine.clone(),
                    clock.clone(),
                    settings.clone(),
                ))
            })
            .collect();
        Self { workers }
    }

    pub fn workers(&self) -> &[Arc<OrchestrationWorker>] {
        &self.workers
    }

    /// Spawn every worker; they stop once `shutdown` is cancelled
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.workers
            .iter()
            .cloned()
            .map(|worker| tokio::spawn(worker.run(shutdown.clone())))
            .collect()
    }
}

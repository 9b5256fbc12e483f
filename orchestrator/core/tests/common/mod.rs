// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared fixtures for the orchestration integration tests: a scripted
//! launcher, an account store with switchable write failures, and an
//! in-memory wiring of the whole state machine driven by a manual clock.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, TimeZone, Utc};
use cordon_core::application::activities::{ExecutionActivities, RetryPolicy};
use cordon_core::application::agent_callbacks::AgentCallbacks;
use cordon_core::application::job_spec::JobSpecBuilder;
use cordon_core::application::result_oracle::ResultOracles;
use cordon_core::application::start_execution::{
    StandardStartAgentExecutionUseCase, StartAgentExecutionUseCase, StartExecutionRequest,
};
use cordon_core::application::state_machine::{ExecutionStateMachine, StateMachineSettings};
use cordon_core::application::worker::{OrchestrationWorker, WorkerSettings};
use cordon_core::domain::answer::AnswerRecord;
use cordon_core::domain::checkpoint::{ExecutionCheckpoint, OrchestrationStep};
use cordon_core::domain::clock::{Clock, ManualClock};
use cordon_core::domain::events::ExecutionEvent;
use cordon_core::domain::execution::{ExecutionId, ExecutionRecord, ParentJobId, TenantId, UserId};
use cordon_core::domain::launcher::{
    CleanupError, ExecutionHandle, JobSpec, LaunchError, LauncherBackend, WorkloadLauncher,
    WorkloadStatus,
};
use cordon_core::domain::manifest::ExecutionPaths;
use cordon_core::domain::node_config::{AgentImages, ResourceConfig};
use cordon_core::domain::repository::{
    AnswerRepository, CheckpointRepository, ExecutionRepository, RepositoryError, ServiceAccountRepository,
};
use cordon_core::domain::service_account::{ServiceAccount, ServiceAccountId};
use cordon_core::domain::storage::ObjectStore;
use cordon_core::infrastructure::repositories::{
    InMemoryAnswerRepository, InMemoryCheckpointRepository, InMemoryExecutionRepository,
    InMemoryOutputFileRepository, InMemoryServiceAccountRepository,
};
use cordon_core::infrastructure::storage::{InMemoryObjectStore, UploadReceiver};
use cordon_core::infrastructure::event_bus::EventReceiver;
use cordon_core::infrastructure::{EventBus, ServiceAccountIssuer};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

pub const POLL_INTERVAL_SECS: i64 = 10;
pub const MAX_WAIT_SECS: i64 = 60;
pub const LEASE_SECS: i64 = 30;
pub const HEARTBEAT: std::time::Duration = std::time::Duration::from_millis(20);

/// Everything already published to `events`, without waiting for more
pub async fn drain_events(events: &mut EventReceiver) -> Vec<ExecutionEvent> {
    let mut drained = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(std::time::Duration::ZERO, events.recv()).await {
        drained.push(event);
    }
    drained
}
const MAX_ROUNDS: usize = 500;

/// Launcher double whose workload statuses are scripted by the test.
///
/// Units are tracked by name, so a second launch under the same name adopts
/// the existing unit the way the real backends do.
#[derive(Default)]
pub struct ScriptedLauncher {
    script: Mutex<VecDeque<WorkloadStatus>>,
    reject: Mutex<Option<String>>,
    unavailable_before_create: AtomicU32,
    unavailable_after_create: AtomicU32,
    live: Mutex<HashSet<String>>,
    specs: Mutex<Vec<JobSpec>>,
    created: AtomicUsize,
    adopted: AtomicUsize,
    status_checks: AtomicUsize,
    cleanups: Mutex<Vec<String>>,
    cleanup_failure: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<LaunchGate>>>,
}

/// Parks the next launch until the test releases it
#[derive(Default)]
pub struct LaunchGate {
    pub entered: Notify,
    pub release: Notify,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses returned by successive status checks; `running` once exhausted
    pub fn script(&self, statuses: impl IntoIterator<Item = WorkloadStatus>) {
        self.script.lock().extend(statuses);
    }

    pub fn reject_with(&self, reason: &str) {
        *self.reject.lock() = Some(reason.to_string());
    }

    /// Fail the next `n` launches before anything is created
    pub fn unavailable_for(&self, n: u32) {
        self.unavailable_before_create.store(n, Ordering::SeqCst);
    }

    /// Create the unit but lose the response for the next `n` launches
    pub fn lose_responses_for(&self, n: u32) {
        self.unavailable_after_create.store(n, Ordering::SeqCst);
    }

    /// Every teardown fails with `reason`; the unit stays live
    pub fn fail_cleanup_with(&self, reason: &str) {
        *self.cleanup_failure.lock() = Some(reason.to_string());
    }

    /// Block the next launch inside the launcher
    pub fn hold_next_launch(&self) -> Arc<LaunchGate> {
        let gate = Arc::new(LaunchGate::default());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn adopted(&self) -> usize {
        self.adopted.load(Ordering::SeqCst)
    }

    pub fn status_checks(&self) -> usize {
        self.status_checks.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> Vec<String> {
        self.cleanups.lock().clone()
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.live.lock().contains(name)
    }

    /// Remove a unit without going through `cleanup`
    pub fn vanish(&self, name: &str) {
        self.live.lock().remove(name);
    }

    pub fn last_spec(&self) -> Option<JobSpec> {
        self.specs.lock().last().cloned()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl WorkloadLauncher for ScriptedLauncher {
    fn backend(&self) -> LauncherBackend {
        LauncherBackend::Docker
    }

    async fn launch(&self, spec: JobSpec) -> Result<ExecutionHandle, LaunchError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if let Some(reason) = self.reject.lock().clone() {
            return Err(LaunchError::Rejected(reason));
        }
        if take_one(&self.unavailable_before_create) {
            return Err(LaunchError::Unavailable("connection refused".to_string()));
        }

        let name = spec.name().to_string();
        self.specs.lock().push(spec);
        let fresh = self.live.lock().insert(name.clone());
        if fresh {
            self.created.fetch_add(1, Ordering::SeqCst);
        } else {
            self.adopted.fetch_add(1, Ordering::SeqCst);
        }

        if take_one(&self.unavailable_after_create) {
            return Err(LaunchError::Unavailable("connection reset while reading response".to_string()));
        }
        Ok(ExecutionHandle::new(LauncherBackend::Docker, name.clone()).with_backend_id(format!("ctr-{}", name)))
    }

    async fn check_status(&self, handle: &ExecutionHandle) -> Result<WorkloadStatus, LaunchError> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        if !self.is_live(&handle.name) {
            return Ok(WorkloadStatus::not_found(&handle.name));
        }
        Ok(self.script.lock().pop_front().unwrap_or_else(WorkloadStatus::running))
    }

    async fn cleanup(&self, handle: &ExecutionHandle) -> Result<(), CleanupError> {
        self.cleanups.lock().push(handle.name.clone());
        if let Some(reason) = self.cleanup_failure.lock().clone() {
            return Err(CleanupError::TeardownFailed {
                name: handle.name.clone(),
                reason,
            });
        }
        self.live.lock().remove(&handle.name);
        Ok(())
    }
}

/// Account store whose updates can be made to fail, so revocation breaks
/// while issuance keeps working
pub struct FlakyAccounts {
    inner: Arc<InMemoryServiceAccountRepository>,
    fail_saves: AtomicBool,
}

impl FlakyAccounts {
    pub fn new(inner: Arc<InMemoryServiceAccountRepository>) -> Self {
        Self {
            inner,
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServiceAccountRepository for FlakyAccounts {
    async fn insert_active(&self, account: &ServiceAccount) -> Result<(), RepositoryError> {
        self.inner.insert_active(account).await
    }

    async fn save(&self, account: &ServiceAccount) -> Result<(), RepositoryError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(RepositoryError::Database("connection reset by peer".to_string()));
        }
        self.inner.save(account).await
    }

    async fn find_by_id(&self, id: ServiceAccountId) -> Result<Option<ServiceAccount>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn find_active_by_execution(&self, execution_id: ExecutionId) -> Result<Option<ServiceAccount>, RepositoryError> {
        self.inner.find_active_by_execution(execution_id).await
    }

    async fn find_by_credential_hash(&self, hash: &str) -> Result<Option<ServiceAccount>, RepositoryError> {
        self.inner.find_by_credential_hash(hash).await
    }
}

/// Whole orchestrator wired to in-memory adapters
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub executions: Arc<InMemoryExecutionRepository>,
    pub checkpoints: Arc<InMemoryCheckpointRepository>,
    pub accounts: Arc<InMemoryServiceAccountRepository>,
    pub account_faults: Arc<FlakyAccounts>,
    pub output_files: Arc<InMemoryOutputFileRepository>,
    pub answers: Arc<InMemoryAnswerRepository>,
    pub store: Arc<InMemoryObjectStore>,
    pub launcher: Arc<ScriptedLauncher>,
    pub issuer: Arc<ServiceAccountIssuer>,
    pub event_bus: EventBus,
    pub machine: Arc<ExecutionStateMachine>,
    pub starter: StandardStartAgentExecutionUseCase,
    pub tenant_id: TenantId,
    pub parent_job_id: ParentJobId,
    pub user_id: UserId,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
        let executions = Arc::new(InMemoryExecutionRepository::new());
        let checkpoints = Arc::new(InMemoryCheckpointRepository::new());
        let accounts = Arc::new(InMemoryServiceAccountRepository::new());
        let output_files = Arc::new(InMemoryOutputFileRepository::new());
        let answers = Arc::new(InMemoryAnswerRepository::new());
        let store = Arc::new(InMemoryObjectStore::new("http://objects.test", b"test-signing-key".to_vec()));
        let launcher = Arc::new(ScriptedLauncher::new());
        let account_faults = Arc::new(FlakyAccounts::new(accounts.clone()));
        let issuer = Arc::new(ServiceAccountIssuer::new(account_faults.clone(), clock.clone()));
        let event_bus = EventBus::with_default_capacity();

        let job_specs = JobSpecBuilder::new(
            AgentImages::default(),
            ResourceConfig::default(),
            "http://api.test",
            store.clone(),
            std::time::Duration::from_secs(3600),
        );
        let oracles = ResultOracles::standard(store.clone(), output_files.clone(), answers.clone(), clock.clone());
        let activities = ExecutionActivities::new(
            executions.clone(),
            checkpoints.clone(),
            issuer.clone(),
            launcher.clone(),
            job_specs,
            oracles,
            event_bus.clone(),
            clock.clone(),
        );
        let settings = StateMachineSettings {
            poll_interval: Duration::seconds(POLL_INTERVAL_SECS),
            max_wait: Duration::seconds(MAX_WAIT_SECS),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::seconds(1),
                max_backoff: Duration::seconds(10),
                multiplier: 2.0,
            },
        };
        let machine = Arc::new(ExecutionStateMachine::new(activities, settings, clock.clone()));
        let starter = StandardStartAgentExecutionUseCase::new(
            executions.clone(),
            checkpoints.clone(),
            event_bus.clone(),
            clock.clone(),
        );

        Self {
            clock,
            executions,
            checkpoints,
            accounts,
            account_faults,
            output_files,
            answers,
            store,
            launcher,
            issuer,
            event_bus,
            machine,
            starter,
            tenant_id: TenantId::new(),
            parent_job_id: ParentJobId(Uuid::new_v4()),
            user_id: UserId(Uuid::new_v4()),
        }
    }

    pub fn worker(&self, id: &str) -> OrchestrationWorker {
        OrchestrationWorker::new(
            id,
            self.checkpoints.clone(),
            self.machine.clone(),
            self.clock.clone(),
            WorkerSettings {
                workers: 1,
                batch_size: 10,
                lease: Duration::seconds(LEASE_SECS),
                idle_backoff: std::time::Duration::from_millis(10),
                heartbeat: HEARTBEAT,
            },
        )
    }

    /// Agent-facing side of the platform, over the same adapters
    pub fn callbacks(&self) -> AgentCallbacks {
        AgentCallbacks::new(
            self.issuer.clone(),
            self.executions.clone(),
            self.checkpoints.clone(),
            self.answers.clone(),
            UploadReceiver::new(self.store.clone(), self.store.signer().clone()),
            self.clock.clone(),
        )
    }

    pub async fn start_workflow(&self) -> ExecutionId {
        self.starter
            .start(StartExecutionRequest::workflow(
                self.parent_job_id,
                self.tenant_id,
                self.user_id,
                serde_json::json!({ "document_ids": ["doc-1"] }),
            ))
            .await
            .unwrap()
            .execution_id
    }

    pub async fn start_question(&self, question_id: Uuid) -> ExecutionId {
        self.starter
            .start(StartExecutionRequest::question_answering(
                self.parent_job_id,
                self.tenant_id,
                self.user_id,
                question_id,
                serde_json::json!({ "question": "What is the notice period?" }),
            ))
            .await
            .unwrap()
            .execution_id
    }

    pub fn paths(&self, execution_id: ExecutionId) -> ExecutionPaths {
        ExecutionPaths::new(self.tenant_id, self.parent_job_id, execution_id)
    }

    /// Upload output files plus a manifest listing them, as an agent would
    pub async fn upload_outputs(&self, execution_id: ExecutionId, files: &[(&str, &str)]) {
        let paths = self.paths(execution_id);
        let mut entries = Vec::new();
        for (name, data) in files {
            self.store
                .put(&paths.output_key(name), Bytes::copy_from_slice(data.as_bytes()))
                .await
                .unwrap();
            entries.push(serde_json::json!({ "name": name, "size": data.len() }));
        }
        self.upload_manifest(execution_id, serde_json::json!({ "files": entries })).await;
    }

    pub async fn upload_manifest(&self, execution_id: ExecutionId, manifest: serde_json::Value) {
        let bytes = serde_json::to_vec(&manifest).unwrap();
        self.store
            .put(&self.paths(execution_id).manifest_key(), Bytes::from(bytes))
            .await
            .unwrap();
    }

    pub async fn post_answer(&self, question_id: Uuid, text: &str) {
        self.answers
            .save(&AnswerRecord {
                id: Uuid::new_v4(),
                tenant_id: self.tenant_id,
                qa_job_id: self.parent_job_id,
                question_id,
                execution_id: None,
                answer_text: text.to_string(),
                citations: serde_json::json!([{ "document_id": "doc-1", "page": 4 }]),
                created_at: self.clock.now(),
            })
            .await
            .unwrap();
    }

    pub async fn record(&self, execution_id: ExecutionId) -> ExecutionRecord {
        self.executions.find_by_id(execution_id).await.unwrap().unwrap()
    }

    pub async fn checkpoint(&self, execution_id: ExecutionId) -> ExecutionCheckpoint {
        self.checkpoints.find_by_id(execution_id).await.unwrap().unwrap()
    }

    pub fn accounts_for(&self, execution_id: ExecutionId) -> Vec<ServiceAccount> {
        self.accounts.all_for_execution(execution_id)
    }

    /// Make the checkpoint due by jumping the clock to its timer
    async fn fire_timer(&self, execution_id: ExecutionId) {
        let cp = self.checkpoint(execution_id).await;
        if cp.wake_at > self.clock.now() {
            self.clock.set(cp.wake_at);
        }
    }

    /// Run steps until the orchestration is done, following every durable timer
    pub async fn drive(&self, worker: &OrchestrationWorker, execution_id: ExecutionId) -> ExecutionRecord {
        for _ in 0..MAX_ROUNDS {
            worker.run_until_idle().await.unwrap();
            if self.checkpoint(execution_id).await.is_finished() {
                return self.record(execution_id).await;
            }
            self.fire_timer(execution_id).await;
        }
        panic!("execution {} did not finish", execution_id);
    }

    /// Run steps until the checkpoint sits at `step`, due now
    pub async fn drive_to(
        &self,
        worker: &OrchestrationWorker,
        execution_id: ExecutionId,
        step: OrchestrationStep,
    ) -> ExecutionCheckpoint {
        for _ in 0..MAX_ROUNDS {
            self.fire_timer(execution_id).await;
            let cp = self.checkpoint(execution_id).await;
            if cp.step == step {
                return cp;
            }
            worker.run_due().await.unwrap();
        }
        panic!("execution {} never reached {:?}", execution_id, step);
    }
}

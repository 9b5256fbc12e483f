// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process orchestrator wiring
//!
//! Builds the repositories, use cases and worker pool from one loaded
//! configuration. With a `spec.database` section every command shares the
//! PostgreSQL tables with running daemons; without one everything lives in
//! memory and only survives as long as this process.

use anyhow::{Context, Result};
use std::sync::Arc;

use cordon_core::{
    application::{
        activities::ExecutionActivities,
        agent_callbacks::AgentCallbacks,
        execution_query::ExecutionQueryService,
        job_spec::JobSpecBuilder,
        result_oracle::ResultOracles,
        start_execution::StandardStartAgentExecutionUseCase,
        state_machine::{ExecutionStateMachine, StateMachineSettings},
        worker::{WorkerPool, WorkerSettings},
    },
    domain::{
        clock::{Clock, SystemClock},
        node_config::OrchestratorConfigManifest,
        repository::{
            AnswerRepository, CheckpointRepository, ExecutionRepository, OutputFileRepository,
            ServiceAccountRepository,
        },
    },
    infrastructure::{
        db::Database,
        launcher::create_launcher,
        repositories::{
            InMemoryAnswerRepository, InMemoryCheckpointRepository, InMemoryExecutionRepository,
            InMemoryOutputFileRepository, InMemoryServiceAccountRepository,
            PostgresAnswerRepository, PostgresCheckpointRepository, PostgresExecutionRepository,
            PostgresOutputFileRepository, PostgresServiceAccountRepository,
        },
        storage::{create_object_store, create_url_signer, UploadReceiver},
        EventBus, ServiceAccountIssuer,
    },
};

/// Every repository the orchestrator needs, on one backend
#[derive(Clone)]
pub struct Repositories {
    pub executions: Arc<dyn ExecutionRepository>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub accounts: Arc<dyn ServiceAccountRepository>,
    pub output_files: Arc<dyn OutputFileRepository>,
    pub answers: Arc<dyn AnswerRepository>,
    pub persistent: bool,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            executions: Arc::new(InMemoryExecutionRepository::new()),
            checkpoints: Arc::new(InMemoryCheckpointRepository::new()),
            accounts: Arc::new(InMemoryServiceAccountRepository::new()),
            output_files: Arc::new(InMemoryOutputFileRepository::new()),
            answers: Arc::new(InMemoryAnswerRepository::new()),
            persistent: false,
        }
    }

    pub fn postgres(db: &Database) -> Self {
        let pool = db.get_pool().clone();
        Self {
            executions: Arc::new(PostgresExecutionRepository::new(pool.clone())),
            checkpoints: Arc::new(PostgresCheckpointRepository::new(pool.clone())),
            accounts: Arc::new(PostgresServiceAccountRepository::new(pool.clone())),
            output_files: Arc::new(PostgresOutputFileRepository::new(pool.clone())),
            answers: Arc::new(PostgresAnswerRepository::new(pool)),
            persistent: true,
        }
    }

    pub async fn from_config(config: &OrchestratorConfigManifest) -> Result<Self> {
        match &config.spec.database {
            Some(db_config) => {
                let db = Database::from_config(db_config)
                    .await
                    .context("Failed to initialize database")?;
                tracing::info!("Using PostgreSQL repositories");
                Ok(Self::postgres(&db))
            }
            None => {
                tracing::warn!("No spec.database configured; executions are kept in memory only");
                Ok(Self::in_memory())
            }
        }
    }
}

pub struct EmbeddedOrchestrator {
    config: OrchestratorConfigManifest,
    repositories: Repositories,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl EmbeddedOrchestrator {
    pub async fn new(config: OrchestratorConfigManifest) -> Result<Self> {
        config.validate().context("Configuration validation failed")?;
        let repositories = Repositories::from_config(&config).await?;
        Ok(Self::with_repositories(config, repositories))
    }

    pub fn with_repositories(config: OrchestratorConfigManifest, repositories: Repositories) -> Self {
        Self {
            config,
            repositories,
            event_bus: EventBus::with_default_capacity(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(&self) -> &OrchestratorConfigManifest {
        &self.config
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn starter(&self) -> StandardStartAgentExecutionUseCase {
        StandardStartAgentExecutionUseCase::new(
            self.repositories.executions.clone(),
            self.repositories.checkpoints.clone(),
            self.event_bus.clone(),
            self.clock.clone(),
        )
    }

    pub fn query(&self) -> ExecutionQueryService {
        ExecutionQueryService::new(
            self.repositories.executions.clone(),
            self.repositories.output_files.clone(),
            self.repositories.checkpoints.clone(),
        )
    }

    /// Platform side of the agent contract: signed uploads and QA answers
    pub fn callbacks(&self) -> Result<AgentCallbacks> {
        let storage = &self.config.spec.storage;
        let store = create_object_store(storage).context("Failed to initialize object storage")?;
        let signer = create_url_signer(storage)?;
        Ok(AgentCallbacks::new(
            Arc::new(ServiceAccountIssuer::new(
                self.repositories.accounts.clone(),
                self.clock.clone(),
            )),
            self.repositories.executions.clone(),
            self.repositories.checkpoints.clone(),
            self.repositories.answers.clone(),
            UploadReceiver::new(store, signer),
            self.clock.clone(),
        ))
    }

    /// Connects the object store and the configured launcher backend
    pub fn state_machine(&self) -> Result<Arc<ExecutionStateMachine>> {
        let spec = &self.config.spec;
        let store = create_object_store(&spec.storage).context("Failed to initialize object storage")?;
        let launcher = create_launcher(&spec.launcher).context("Failed to initialize workload launcher")?;
        let issuer = Arc::new(ServiceAccountIssuer::new(
            self.repositories.accounts.clone(),
            self.clock.clone(),
        ));

        let job_specs = JobSpecBuilder::new(
            spec.launcher.images.clone(),
            spec.launcher.resources.clone(),
            spec.agent.api_endpoint.clone(),
            store.clone(),
            std::time::Duration::from_secs(spec.orchestration.upload_url_ttl_secs),
        )
        .with_extra_env(spec.agent.env.clone());

        let oracles = ResultOracles::standard(
            store,
            self.repositories.output_files.clone(),
            self.repositories.answers.clone(),
            self.clock.clone(),
        );

        let activities = ExecutionActivities::new(
            self.repositories.executions.clone(),
            self.repositories.checkpoints.clone(),
            issuer,
            launcher,
            job_specs,
            oracles,
            self.event_bus.clone(),
            self.clock.clone(),
        );

        Ok(Arc::new(ExecutionStateMachine::new(
            activities,
            StateMachineSettings::from_config(&spec.orchestration),
            self.clock.clone(),
        )))
    }

    pub fn worker_pool(&self, name: &str) -> Result<WorkerPool> {
        let machine = self.state_machine()?;
        Ok(WorkerPool::new(
            name,
            self.repositories.checkpoints.clone(),
            machine,
            self.clock.clone(),
            WorkerSettings::from_config(&self.config.spec.orchestration),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_core::application::start_execution::{StartAgentExecutionUseCase, StartExecutionRequest};
    use cordon_core::domain::checkpoint::OrchestrationStep;
    use cordon_core::domain::execution::{ExecutionStatus, ParentJobId, TenantId, UserId};
    use cordon_core::domain::node_config::StorageBackendKind;
    use uuid::Uuid;

    fn in_memory_config() -> OrchestratorConfigManifest {
        let mut config = OrchestratorConfigManifest::default();
        config.spec.storage.backend = StorageBackendKind::Memory;
        config.spec.storage.signing_key = "test-signing-key".to_string();
        config
    }

    #[tokio::test]
    async fn test_start_then_describe_in_memory() {
        let orchestrator = EmbeddedOrchestrator::with_repositories(in_memory_config(), Repositories::in_memory());
        let tenant = TenantId::new();

        let started = orchestrator
            .starter()
            .start(StartExecutionRequest::workflow(
                ParentJobId(Uuid::new_v4()),
                tenant,
                UserId(Uuid::new_v4()),
                serde_json::json!({"prompt": "summarize"}),
            ))
            .await
            .unwrap();

        let details = orchestrator.query().describe(tenant, started.execution_id).await.unwrap();
        assert_eq!(details.record.status, ExecutionStatus::Pending);
        assert_eq!(details.current_step, Some(OrchestrationStep::MarkRunning));
        assert!(details.output_files.is_empty());

        // other tenants see nothing
        assert!(orchestrator.query().describe(TenantId::new(), started.execution_id).await.is_err());
    }

    #[test]
    fn test_in_memory_repositories_are_not_persistent() {
        assert!(!Repositories::in_memory().persistent);
    }
}

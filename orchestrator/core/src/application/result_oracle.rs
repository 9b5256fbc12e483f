// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Result Oracles
//!
//! A workload exiting cleanly proves nothing on its own. Each execution kind
//! has an oracle that decides whether the agent actually produced a result
//! and turns it into the summary stored on the execution record:
//!
//! - [`ManifestResultOracle`] (workflow agents): the uploaded manifest must
//!   exist, parse, and every file it lists must already be in the object
//!   store with the declared size. One output file row is written per entry.
//! - [`AnswerRecordResultOracle`] (QA agents): the answer the agent posted
//!   for its question must exist.
//!
//! Oracles are injected per [`ExecutionKind`] through [`ResultOracles`].

use crate::application::activities::ActivityError;
use crate::domain::checkpoint::ExecutionTask;
use crate::domain::clock::Clock;
use crate::domain::execution::{ExecutionId, ExecutionKind, FailureCategory};
use crate::domain::manifest::{ExecutionManifest, ExecutionPaths, OutputFile};
use crate::domain::repository::{AnswerRepository, OutputFileRepository};
use crate::domain::storage::ObjectStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Everything an oracle may look at
#[derive(Debug, Clone, Copy)]
pub struct ExtractionContext<'a> {
    pub execution_id: ExecutionId,
    pub task: &'a ExecutionTask,
    pub exit_code: Option<i64>,
}

impl ExtractionContext<'_> {
    pub fn paths(&self) -> ExecutionPaths {
        ExecutionPaths::new(self.task.tenant_id, self.task.parent_job_id, self.execution_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedResult {
    pub summary: serde_json::Value,
    pub output_size_bytes: i64,
    pub output_count: usize,
}

#[async_trait]
pub trait ResultOracle: Send + Sync {
    /// Verify the agent's result. Absent results are a fatal
    /// [`FailureCategory::ExecutionFailed`], never an empty success.
    async fn extract(&self, ctx: &ExtractionContext<'_>) -> Result<ExtractedResult, ActivityError>;
}

/// Download and validate the completion manifest. `Ok(None)` when absent.
pub async fn fetch_manifest(
    store: &dyn ObjectStore,
    paths: &ExecutionPaths,
) -> Result<Option<ExecutionManifest>, ActivityError> {
    let Some(bytes) = store.get(&paths.manifest_key()).await? else {
        return Ok(None);
    };
    ExecutionManifest::parse(&bytes).map(Some).map_err(|e| {
        ActivityError::fatal(
            FailureCategory::ExecutionFailed,
            format!("agent uploaded an invalid manifest: {}", e),
        )
    })
}

pub struct ManifestResultOracle {
    store: Arc<dyn ObjectStore>,
    output_files: Arc<dyn OutputFileRepository>,
    clock: Arc<dyn Clock>,
}

impl ManifestResultOracle {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        output_files: Arc<dyn OutputFileRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, output_files, clock }
    }
}

#[async_trait]
impl ResultOracle for ManifestResultOracle {
    async fn extract(&self, ctx: &ExtractionContext<'_>) -> Result<ExtractedResult, ActivityError> {
        let paths = ctx.paths();
        let manifest = fetch_manifest(self.store.as_ref(), &paths).await?.ok_or_else(|| {
            ActivityError::fatal(
                FailureCategory::ExecutionFailed,
                "agent did not signal completion correctly: no manifest was uploaded",
            )
        })?;

        // every declared file must be present before any row is written
        for file in &manifest.files {
            let key = paths.output_key(&file.name);
            let meta = self.store.head(&key).await?.ok_or_else(|| {
                ActivityError::fatal(
                    FailureCategory::ExecutionFailed,
                    format!("manifest lists '{}' but it was never uploaded", file.name),
                )
            })?;
            if meta.size != file.size as u64 {
                return Err(ActivityError::fatal(
                    FailureCategory::ExecutionFailed,
                    format!(
                        "manifest declares {} bytes for '{}' but {} were uploaded",
                        file.size, file.name, meta.size
                    ),
                ));
            }
        }

        let now = self.clock.now();
        for file in &manifest.files {
            let row = OutputFile::from_descriptor(&paths, file, now);
            self.output_files.save(&row).await?;
            debug!(execution_id = %ctx.execution_id, file = %row.name, "Recorded output file");
        }

        let output_size_bytes = manifest.total_size();
        info!(
            execution_id = %ctx.execution_id,
            files = manifest.files.len(),
            bytes = output_size_bytes,
            "Manifest verified"
        );

        Ok(ExtractedResult {
            summary: serde_json::json!({
                "file_count": manifest.files.len(),
                "files": manifest.files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
                "metadata": manifest.metadata,
            }),
            output_size_bytes,
            output_count: manifest.files.len(),
        })
    }
}

/// Question id a QA execution answers, read from its task parameters
pub fn question_id(parameters: &serde_json::Value) -> Option<Uuid> {
    parameters
        .get("question_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

pub struct AnswerRecordResultOracle {
    answers: Arc<dyn AnswerRepository>,
}

impl AnswerRecordResultOracle {
    pub fn new(answers: Arc<dyn AnswerRepository>) -> Self {
        Self { answers }
    }
}

#[async_trait]
impl ResultOracle for AnswerRecordResultOracle {
    async fn extract(&self, ctx: &ExtractionContext<'_>) -> Result<ExtractedResult, ActivityError> {
        let question_id = question_id(&ctx.task.parameters).ok_or_else(|| {
            ActivityError::fatal(
                FailureCategory::Internal,
                "question answering task has no valid question_id",
            )
        })?;

        let answer = self
            .answers
            .find_for_question(ctx.task.tenant_id, ctx.task.parent_job_id, question_id)
            .await?
            .ok_or_else(|| {
                ActivityError::fatal(
                    FailureCategory::ExecutionFailed,
                    format!("agent did not submit an answer for question {}", question_id),
                )
            })?;

        Ok(ExtractedResult {
            summary: answer.summary(),
            output_size_bytes: answer.size_bytes(),
            output_count: 1,
        })
    }
}

/// Oracle registry keyed by execution kind
#[derive(Clone, Default)]
pub struct ResultOracles {
    oracles: HashMap<ExecutionKind, Arc<dyn ResultOracle>>,
}

impl ResultOracles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ExecutionKind, oracle: Arc<dyn ResultOracle>) -> Self {
        self.oracles.insert(kind, oracle);
        self
    }

    /// Manifest oracle for workflows, answer oracle for question answering
    pub fn standard(
        store: Arc<dyn ObjectStore>,
        output_files: Arc<dyn OutputFileRepository>,
        answers: Arc<dyn AnswerRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new()
            .with(
                ExecutionKind::Workflow,
                Arc::new(ManifestResultOracle::new(store, output_files, clock)),
            )
            .with(
                ExecutionKind::QuestionAnswering,
                Arc::new(AnswerRecordResultOracle::new(answers)),
            )
    }

    pub fn get(&self, kind: ExecutionKind) -> Option<Arc<dyn ResultOracle>> {
        self.oracles.get(&kind).cloned()
    }
}

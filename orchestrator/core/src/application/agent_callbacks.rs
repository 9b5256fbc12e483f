// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent Callbacks
//!
//! The two things a running agent asks of the platform: storing an upload
//! made through a presigned URL, and recording a QA answer posted with its
//! execution credential. The HTTP routes in front of these live elsewhere;
//! `cordon agent` calls them directly for single-node runs.
//!
//! # Architecture
//!
//! - **Layer:** Application
//! - **Collaborators:** CredentialIssuer, ExecutionRepository,
//!   CheckpointRepository, AnswerRepository, UploadReceiver

use crate::application::result_oracle::question_id;
use crate::domain::answer::AnswerRecord;
use crate::domain::clock::Clock;
use crate::domain::execution::{ExecutionId, ExecutionKind, ExecutionStatus};
use crate::domain::repository::{AnswerRepository, CheckpointRepository, ExecutionRepository, RepositoryError};
use crate::domain::service_account::{CredentialError, CredentialIssuer};
use crate::domain::storage::{ObjectMeta, StorageError};
use crate::infrastructure::storage::UploadReceiver;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CallbackError {
    /// Unknown, revoked or mismatched credential
    #[error("Credential is not valid for any execution")]
    Unauthorized,

    #[error("Execution {0} is not a question answering execution")]
    NotQuestionAnswering(ExecutionId),

    #[error("Execution {0} is {1}, answers are only accepted while running")]
    NotRunning(ExecutionId, ExecutionStatus),

    #[error("Execution {0} has no question to answer")]
    NoQuestion(ExecutionId),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Answer body as posted by the agent
#[derive(Debug, Clone)]
pub struct SubmittedAnswer {
    pub answer_text: String,
    pub citations: serde_json::Value,
}

pub struct AgentCallbacks {
    issuer: Arc<dyn CredentialIssuer>,
    executions: Arc<dyn ExecutionRepository>,
    checkpoints: Arc<dyn CheckpointRepository>,
    answers: Arc<dyn AnswerRepository>,
    uploads: UploadReceiver,
    clock: Arc<dyn Clock>,
}

impl AgentCallbacks {
    pub fn new(
        issuer: Arc<dyn CredentialIssuer>,
        executions: Arc<dyn ExecutionRepository>,
        checkpoints: Arc<dyn CheckpointRepository>,
        answers: Arc<dyn AnswerRepository>,
        uploads: UploadReceiver,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            issuer,
            executions,
            checkpoints,
            answers,
            uploads,
            clock,
        }
    }

    /// Store a file sent to a presigned URL
    pub async fn upload(&self, url: &str, data: Bytes) -> Result<ObjectMeta, CallbackError> {
        Ok(self.uploads.receive(url, data).await?)
    }

    /// Record the answer of the QA execution `credential` was issued to.
    ///
    /// The question comes from the execution's own task, never from the agent.
    pub async fn submit_answer(
        &self,
        credential: &str,
        answer: SubmittedAnswer,
    ) -> Result<AnswerRecord, CallbackError> {
        let Some(account) = self.issuer.authenticate(credential).await? else {
            warn!("Answer rejected: credential did not authenticate");
            return Err(CallbackError::Unauthorized);
        };

        let record = match self.executions.find_by_id(account.execution_id).await? {
            Some(record) if record.tenant_id == account.tenant_id => record,
            _ => return Err(CallbackError::Unauthorized),
        };
        if record.kind != ExecutionKind::QuestionAnswering {
            return Err(CallbackError::NotQuestionAnswering(record.id));
        }
        if record.status != ExecutionStatus::Running {
            return Err(CallbackError::NotRunning(record.id, record.status));
        }

        let question = self
            .checkpoints
            .find_by_id(record.id)
            .await?
            .and_then(|cp| question_id(&cp.state.task.parameters))
            .ok_or(CallbackError::NoQuestion(record.id))?;

        let stored = AnswerRecord {
            id: Uuid::new_v4(),
            tenant_id: record.tenant_id,
            qa_job_id: record.parent_job_id,
            question_id: question,
            execution_id: Some(record.id),
            answer_text: answer.answer_text,
            citations: answer.citations,
            created_at: self.clock.now(),
        };
        self.answers.save(&stored).await?;

        info!(execution_id = %record.id, question_id = %question, "Answer recorded");
        Ok(stored)
    }
}

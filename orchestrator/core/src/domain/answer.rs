// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Answer records written by question-answering agents.
//!
//! A QA agent's completion contract is "POST your answer to the API", not
//! "upload a manifest". The orchestrator only reads these rows to decide
//! whether a QA execution actually produced a result.

use crate::domain::execution::{ExecutionId, ParentJobId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub qa_job_id: ParentJobId,
    pub question_id: Uuid,
    /// Execution whose service account posted the answer, when known
    pub execution_id: Option<ExecutionId>,
    pub answer_text: String,
    #[serde(default)]
    pub citations: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AnswerRecord {
    /// Output summary stored on the execution record
    pub fn summary(&self) -> serde_json::Value {
        let citation_count = self.citations.as_array().map(|c| c.len()).unwrap_or(0);
        serde_json::json!({
            "answer_id": self.id,
            "question_id": self.question_id,
            "answer_length": self.answer_text.chars().count(),
            "citation_count": citation_count,
        })
    }

    pub fn size_bytes(&self) -> i64 {
        self.answer_text.len() as i64
    }
}

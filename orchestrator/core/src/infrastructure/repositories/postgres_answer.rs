// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;
use crate::domain::answer::AnswerRecord;
use crate::domain::execution::{ExecutionId, ParentJobId, TenantId};
use crate::domain::repository::{AnswerRepository, RepositoryError};

pub struct PostgresAnswerRepository {
    pool: PgPool,
}

impl PostgresAnswerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn answer_from_row(row: &PgRow) -> Result<AnswerRecord, RepositoryError> {
    let execution_id: Option<Uuid> = row.try_get("execution_id")?;
    Ok(AnswerRecord {
        id: row.try_get("id")?,
        tenant_id: TenantId(row.try_get("tenant_id")?),
        qa_job_id: ParentJobId(row.try_get("qa_job_id")?),
        question_id: row.try_get("question_id")?,
        execution_id: execution_id.map(ExecutionId),
        answer_text: row.try_get("answer_text")?,
        citations: row.try_get("citations")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl AnswerRepository for PostgresAnswerRepository {
    async fn save(&self, answer: &AnswerRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO qa_answers (
                id, tenant_id, qa_job_id, question_id, execution_id, answer_text, citations, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                answer_text = EXCLUDED.answer_text,
                citations = EXCLUDED.citations
            "#
        )
        .bind(answer.id)
        .bind(answer.tenant_id.0)
        .bind(answer.qa_job_id.0)
        .bind(answer.question_id)
        .bind(answer.execution_id.map(|e| e.0))
        .bind(&answer.answer_text)
        .bind(&answer.citations)
        .bind(answer.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_for_question(
        &self,
        tenant_id: TenantId,
        qa_job_id: ParentJobId,
        question_id: Uuid,
    ) -> Result<Option<AnswerRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, qa_job_id, question_id, execution_id, answer_text, citations, created_at
            FROM qa_answers
            WHERE tenant_id = $1 AND qa_job_id = $2 AND question_id = $3
            ORDER BY created_at DESC
            LIMIT 1
            "#
        )
        .bind(tenant_id.0)
        .bind(qa_job_id.0)
        .bind(question_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(answer_from_row).transpose()
    }
}

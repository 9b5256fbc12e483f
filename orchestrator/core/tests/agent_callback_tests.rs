// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The agent's side of the contract, end to end: uploads through the URLs in
//! its environment and answers posted with its execution credential.

mod common;

use bytes::Bytes;
use common::Harness;
use cordon_core::application::agent_callbacks::{CallbackError, SubmittedAnswer};
use cordon_core::application::job_spec::{ENV_API_KEY, ENV_MANIFEST_UPLOAD_URL, ENV_OUTPUT_UPLOAD_URL};
use cordon_core::domain::checkpoint::OrchestrationStep;
use cordon_core::domain::execution::ExecutionStatus;
use cordon_core::domain::launcher::WorkloadStatus;
use cordon_core::domain::repository::OutputFileRepository;
use cordon_core::domain::storage::{ObjectStore, StorageError};
use uuid::Uuid;

fn file_url(grant: &str, name: &str) -> String {
    let (path, query) = grant.split_once('?').unwrap();
    format!("{}{}?{}", path, name, query)
}

fn answer(text: &str) -> SubmittedAnswer {
    SubmittedAnswer {
        answer_text: text.to_string(),
        citations: serde_json::json!([{ "document_id": "doc-1", "page": 2 }]),
    }
}

#[tokio::test]
async fn test_workflow_agent_uploads_through_its_grants() {
    let h = Harness::new();
    let worker = h.worker("worker-1");
    let callbacks = h.callbacks();
    let id = h.start_workflow().await;
    h.launcher.script([WorkloadStatus::completed(Some(0))]);

    h.drive_to(&worker, id, OrchestrationStep::Poll).await;
    let spec = h.launcher.last_spec().unwrap();
    let outputs = spec.env()[ENV_OUTPUT_UPLOAD_URL].clone();

    let meta = callbacks
        .upload(&file_url(&outputs, "report.md"), Bytes::from_static(b"# Findings"))
        .await
        .unwrap();
    assert_eq!(meta.key, h.paths(id).output_key("report.md"));

    let manifest = serde_json::json!({ "files": [{ "name": "report.md", "size": 10 }] });
    callbacks
        .upload(
            &spec.env()[ENV_MANIFEST_UPLOAD_URL],
            Bytes::from(serde_json::to_vec(&manifest).unwrap()),
        )
        .await
        .unwrap();

    let record = h.drive(&worker, id).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.output_size_bytes, Some(10));
    let files = h.output_files.find_by_execution(h.tenant_id, id).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].storage_key, h.paths(id).output_key("report.md"));
}

#[tokio::test]
async fn test_outputs_grant_cannot_overwrite_the_manifest() {
    let h = Harness::new();
    let worker = h.worker("worker-1");
    let callbacks = h.callbacks();
    let id = h.start_workflow().await;

    h.drive_to(&worker, id, OrchestrationStep::Poll).await;
    let outputs = h.launcher.last_spec().unwrap().env()[ENV_OUTPUT_UPLOAD_URL].clone();

    let escape = file_url(&outputs, "x").replace("/outputs/x", "/.manifest.json");
    let err = callbacks.upload(&escape, Bytes::from_static(b"{}")).await.unwrap_err();
    assert!(matches!(err, CallbackError::Storage(StorageError::PermissionDenied(_))));

    let nested = file_url(&outputs, "deeper/x.md");
    assert!(callbacks.upload(&nested, Bytes::from_static(b"x")).await.is_err());
    assert!(h.store.get(&h.paths(id).manifest_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_qa_agent_answer_completes_the_execution() {
    let h = Harness::new();
    let worker = h.worker("worker-1");
    let callbacks = h.callbacks();
    let question = Uuid::new_v4();
    let id = h.start_question(question).await;
    h.launcher.script([WorkloadStatus::running(), WorkloadStatus::completed(Some(0))]);

    h.drive_to(&worker, id, OrchestrationStep::Poll).await;
    let credential = h.launcher.last_spec().unwrap().env()[ENV_API_KEY].clone();

    let stored = callbacks.submit_answer(&credential, answer("Ninety days.")).await.unwrap();
    assert_eq!(stored.question_id, question);
    assert_eq!(stored.qa_job_id, h.parent_job_id);
    assert_eq!(stored.execution_id, Some(id));

    let record = h.drive(&worker, id).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.output_summary.unwrap()["answer_id"], stored.id.to_string());

    // the credential died with the execution
    let late = callbacks.submit_answer(&credential, answer("Actually, sixty.")).await;
    assert!(matches!(late, Err(CallbackError::Unauthorized)));
}

#[tokio::test]
async fn test_answers_need_a_running_qa_execution() {
    let h = Harness::new();
    let worker = h.worker("worker-1");
    let callbacks = h.callbacks();

    assert!(matches!(
        callbacks.submit_answer("cx_made-up", answer("hi")).await,
        Err(CallbackError::Unauthorized)
    ));

    let id = h.start_workflow().await;
    h.drive_to(&worker, id, OrchestrationStep::Poll).await;
    let credential = h.launcher.last_spec().unwrap().env()[ENV_API_KEY].clone();

    let result = callbacks.submit_answer(&credential, answer("not my job")).await;
    assert!(matches!(result, Err(CallbackError::NotQuestionAnswering(e)) if e == id));
}

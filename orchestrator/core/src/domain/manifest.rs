// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Result Manifest Protocol
//!
//! After finishing, a workflow agent uploads its output files and one JSON
//! manifest enumerating them to a deterministic per-execution prefix:
//!
//! ```text
//! {tenant}/{job}/executions/{execution}/outputs/{filename}
//! {tenant}/{job}/executions/{execution}/.manifest.json
//! ```
//!
//! The orchestrator only reads. Agent-reported success is never trusted: the
//! manifest must be present and well-formed, and every file it names must be
//! present in the object store, before any output record is written.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Path conventions, manifest parsing/validation, output file entity

use crate::domain::execution::{ExecutionId, ParentJobId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

pub const MANIFEST_FILE_NAME: &str = ".manifest.json";
const MAX_FILE_NAME_LEN: usize = 255;

/// Object-store key layout for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPaths {
    pub tenant_id: TenantId,
    pub parent_job_id: ParentJobId,
    pub execution_id: ExecutionId,
}

impl ExecutionPaths {
    pub fn new(tenant_id: TenantId, parent_job_id: ParentJobId, execution_id: ExecutionId) -> Self {
        Self { tenant_id, parent_job_id, execution_id }
    }

    pub fn root(&self) -> String {
        format!(
            "{}/{}/executions/{}",
            self.tenant_id, self.parent_job_id, self.execution_id
        )
    }

    /// Prefix (with trailing slash) under which the agent uploads outputs
    pub fn outputs_prefix(&self) -> String {
        format!("{}/outputs/", self.root())
    }

    pub fn output_key(&self, file_name: &str) -> String {
        format!("{}{}", self.outputs_prefix(), file_name)
    }

    pub fn manifest_key(&self) -> String {
        format!("{}/{}", self.root(), MANIFEST_FILE_NAME)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFileDescriptor {
    pub name: String,
    /// Signed so that a negative size is detected instead of failing to parse opaquely
    pub size: i64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionManifest {
    #[serde(default)]
    pub files: Vec<OutputFileDescriptor>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Manifest is not valid JSON: {0}")]
    Parse(String),
    #[error("Manifest entry {index} has an empty file name")]
    EmptyName { index: usize },
    #[error("Manifest entry '{name}' has negative size {size}")]
    NegativeSize { name: String, size: i64 },
    #[error("Manifest entry '{0}' is not a plain file name")]
    UnsafeName(String),
    #[error("Manifest lists '{0}' more than once")]
    DuplicateName(String),
}

impl ExecutionManifest {
    /// Parse and validate a manifest. Malformed manifests are rejected whole.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: ExecutionManifest =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::Parse(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = HashSet::new();
        for (index, file) in self.files.iter().enumerate() {
            if file.name.is_empty() {
                return Err(ManifestError::EmptyName { index });
            }
            if file.size < 0 {
                return Err(ManifestError::NegativeSize {
                    name: file.name.clone(),
                    size: file.size,
                });
            }
            if !is_plain_file_name(&file.name) {
                return Err(ManifestError::UnsafeName(file.name.clone()));
            }
            if !seen.insert(file.name.as_str()) {
                return Err(ManifestError::DuplicateName(file.name.clone()));
            }
        }
        Ok(())
    }

    pub fn total_size(&self) -> i64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// A single path segment that cannot escape the outputs prefix
fn is_plain_file_name(name: &str) -> bool {
    name.len() <= MAX_FILE_NAME_LEN
        && name != "."
        && name != ".."
        && name != MANIFEST_FILE_NAME
        && !name.contains(['/', '\\', '\0'])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputFileId(pub Uuid);

impl OutputFileId {
    /// Stable id per (execution, file name) so re-running extraction upserts
    pub fn for_file(execution_id: ExecutionId, name: &str) -> Self {
        Self(Uuid::new_v5(&execution_id.0, name.as_bytes()))
    }
}

/// Database row pointing at an output file the agent already uploaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub id: OutputFileId,
    pub tenant_id: TenantId,
    pub parent_job_id: ParentJobId,
    pub execution_id: ExecutionId,
    pub name: String,
    pub storage_key: String,
    pub size_bytes: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl OutputFile {
    pub fn from_descriptor(
        paths: &ExecutionPaths,
        descriptor: &OutputFileDescriptor,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OutputFileId::for_file(paths.execution_id, &descriptor.name),
            tenant_id: paths.tenant_id,
            parent_job_id: paths.parent_job_id,
            execution_id: paths.execution_id,
            name: descriptor.name.clone(),
            storage_key: paths.output_key(&descriptor.name),
            size_bytes: descriptor.size,
            metadata: serde_json::Value::Object(descriptor.metadata.clone()),
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> ExecutionPaths {
        ExecutionPaths::new(
            TenantId(Uuid::nil()),
            ParentJobId(Uuid::from_u128(1)),
            ExecutionId(Uuid::from_u128(2)),
        )
    }

    #[test]
    fn test_paths_layout() {
        let p = paths();
        assert_eq!(
            p.manifest_key(),
            "00000000-0000-0000-0000-000000000000/00000000-0000-0000-0000-000000000001/executions/00000000-0000-0000-0000-000000000002/.manifest.json"
        );
        assert!(p.output_key("report.pdf").ends_with("/outputs/report.pdf"));
        assert!(p.output_key("report.pdf").starts_with(&p.root()));
    }

    #[test]
    fn test_parse_valid_manifest() {
        let json = br#"{
            "files": [
                {"name": "summary.md", "size": 120, "metadata": {"mime": "text/markdown"}},
                {"name": "table.csv", "size": 0}
            ],
            "metadata": {"agent_version": "2.1"}
        }"#;
        let manifest = ExecutionManifest::parse(json).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].name, "summary.md");
        assert_eq!(manifest.total_size(), 120);
        assert_eq!(manifest.metadata["agent_version"], "2.1");
    }

    #[test]
    fn test_empty_manifest_is_well_formed() {
        let manifest = ExecutionManifest::parse(b"{}").unwrap();
        assert!(manifest.files.is_empty());
    }

    #[test]
    fn test_rejects_malformed_entries() {
        assert!(matches!(
            ExecutionManifest::parse(b"not json"),
            Err(ManifestError::Parse(_))
        ));
        assert_eq!(
            ExecutionManifest::parse(br#"{"files":[{"name":"","size":1}]}"#),
            Err(ManifestError::EmptyName { index: 0 })
        );
        assert_eq!(
            ExecutionManifest::parse(br#"{"files":[{"name":"a","size":-5}]}"#),
            Err(ManifestError::NegativeSize { name: "a".into(), size: -5 })
        );
        assert_eq!(
            ExecutionManifest::parse(br#"{"files":[{"name":"../../etc/passwd","size":1}]}"#),
            Err(ManifestError::UnsafeName("../../etc/passwd".into()))
        );
        assert_eq!(
            ExecutionManifest::parse(br#"{"files":[{"name":"a","size":1},{"name":"a","size":2}]}"#),
            Err(ManifestError::DuplicateName("a".into()))
        );
    }

    #[test]
    fn test_output_file_ids_are_stable() {
        let p = paths();
        let d = OutputFileDescriptor { name: "x.txt".into(), size: 3, metadata: Default::default() };
        let a = OutputFile::from_descriptor(&p, &d, Utc::now());
        let b = OutputFile::from_descriptor(&p, &d, Utc::now());
        assert_eq!(a.id, b.id);
        assert_eq!(a.storage_key, p.output_key("x.txt"));
    }
}

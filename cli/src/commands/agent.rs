// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `cordon agent`: the calls an agent container makes back to the platform
//!
//! Handy for single-node runs and for exercising a deployment by hand. Both
//! subcommands read the same environment variables the launcher injects.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use cordon_core::application::agent_callbacks::SubmittedAnswer;
use cordon_core::domain::node_config::OrchestratorConfigManifest;

use crate::embedded::EmbeddedOrchestrator;

#[derive(Subcommand, Debug, Clone)]
pub enum AgentCommand {
    /// Upload a file through a presigned URL
    Upload {
        /// Presigned URL, either an exact object or an outputs prefix
        #[arg(long, env = "CORDON_OUTPUT_UPLOAD_URL")]
        url: String,

        /// File name under the prefix; required for prefix grants
        #[arg(long)]
        name: Option<String>,

        /// Local file to send
        file: PathBuf,
    },

    /// Post the answer of the running QA execution
    Answer {
        /// Execution credential
        #[arg(long, env = "CORDON_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Answer text
        #[arg(long)]
        text: String,

        /// Citations as a JSON array
        #[arg(long, default_value = "[]")]
        citations: String,
    },
}

pub async fn run(command: AgentCommand, config: OrchestratorConfigManifest) -> Result<()> {
    let orchestrator = EmbeddedOrchestrator::new(config).await?;
    let callbacks = orchestrator.callbacks()?;

    match command {
        AgentCommand::Upload { url, name, file } => {
            let url = target_url(&url, name.as_deref())?;
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let meta = callbacks.upload(&url, Bytes::from(data)).await?;
            println!("{} {} ({} bytes)", "Uploaded".green(), meta.key, meta.size);
        }
        AgentCommand::Answer {
            api_key,
            text,
            citations,
        } => {
            let citations: serde_json::Value =
                serde_json::from_str(&citations).context("--citations is not valid JSON")?;
            if !citations.is_array() {
                anyhow::bail!("--citations must be a JSON array");
            }
            let stored = callbacks
                .submit_answer(
                    &api_key,
                    SubmittedAnswer {
                        answer_text: text,
                        citations,
                    },
                )
                .await?;
            println!("{} {}", "Answer recorded".green(), stored.id);
        }
    }
    Ok(())
}

/// Prefix grants end in `/` before the query; the file name goes there.
fn target_url(url: &str, name: Option<&str>) -> Result<String> {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    match (path.ends_with('/'), name) {
        (true, Some(name)) => {
            if name.is_empty() || name.contains('/') {
                anyhow::bail!("--name must be a single file name");
            }
            let encoded = percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC);
            Ok(format!("{}{}?{}", path, encoded, query))
        }
        (true, None) => anyhow::bail!("--name is required for an outputs prefix URL"),
        (false, Some(_)) => anyhow::bail!("--name only applies to prefix URLs"),
        (false, None) => Ok(url.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "http://127.0.0.1:8088/uploads/t/e/outputs/?method=PUT&prefix=t%2Fe%2Foutputs&expires=1&signature=ab";

    #[test]
    fn test_prefix_url_takes_the_file_name() {
        let url = target_url(PREFIX, Some("report v2.md")).unwrap();
        assert!(url.starts_with("http://127.0.0.1:8088/uploads/t/e/outputs/report%20v2%2Emd?method=PUT"));
        assert!(url.ends_with("&signature=ab"));
    }

    #[test]
    fn test_prefix_url_needs_a_flat_name() {
        assert!(target_url(PREFIX, None).is_err());
        assert!(target_url(PREFIX, Some("a/b.md")).is_err());
        assert!(target_url(PREFIX, Some("")).is_err());
    }

    #[test]
    fn test_object_url_is_used_as_is() {
        let url = "http://127.0.0.1:8088/uploads/t/e/.manifest.json?expires=1&signature=ab";
        assert_eq!(target_url(url, None).unwrap(), url);
        assert!(target_url(url, Some("x")).is_err());
    }
}

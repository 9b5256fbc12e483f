// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use cordon_core::domain::node_config::{resolve_env_value, OrchestratorConfigManifest};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show => show(config_override),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
    }
}

fn show(config_override: Option<PathBuf>) -> Result<()> {
    let config = OrchestratorConfigManifest::load_or_default(config_override)
        .context("Failed to load configuration")?;

    let spec = &config.spec;
    println!("{} {}", "Configuration:".bold(), config.metadata.name);
    println!();

    println!("{}", "Launcher:".bold());
    println!("  Backend: {}", spec.launcher.backend.as_str());
    println!(
        "  Workflow image: {}:{}",
        spec.launcher.images.workflow.image, spec.launcher.images.workflow.tag
    );
    println!(
        "  QA image: {}:{}",
        spec.launcher.images.question_answering.image, spec.launcher.images.question_answering.tag
    );
    println!(
        "  Resources: {}m CPU, {} MiB",
        spec.launcher.resources.cpu_millis, spec.launcher.resources.memory_mb
    );
    if let Some(k8s) = &spec.launcher.kubernetes {
        println!("  Kubernetes: {} (namespace {})", k8s.api_server, k8s.namespace);
    }
    println!();

    println!("{}", "Orchestration:".bold());
    let orchestration = &spec.orchestration;
    println!("  Poll interval: {}s", orchestration.poll_interval_secs);
    println!("  Max wait: {}s", orchestration.max_wait_secs);
    println!(
        "  Workers: {} (batch {}, lease {}s)",
        orchestration.workers, orchestration.batch_size, orchestration.lease_secs
    );
    println!(
        "  Retries: {} attempts, {}ms initial backoff",
        orchestration.retry.max_attempts, orchestration.retry.initial_backoff_ms
    );
    println!();

    println!("{}", "Storage:".bold());
    println!("  Backend: {:?}", spec.storage.backend);
    println!("  Path: {}", spec.storage.path);
    println!("  Signing key: {}", describe_secret(&spec.storage.signing_key));
    println!();

    println!("{}", "Database:".bold());
    match &spec.database {
        Some(db) => println!("  URL: {}", describe_secret(&db.url)),
        None => println!("  {}", "(none, in-memory repositories)".dimmed()),
    }
    println!();

    println!("{}", "Observability:".bold());
    println!(
        "  Logging: {} ({})",
        spec.observability.log_level, spec.observability.log_format
    );
    match spec.observability.metrics_port {
        Some(port) => println!("  Metrics: 0.0.0.0:{}/metrics", port),
        None => println!("  Metrics: {}", "(disabled)".dimmed()),
    }

    Ok(())
}

/// Secret values are only ever shown by reference
fn describe_secret(value: &str) -> String {
    match value.strip_prefix("env:") {
        Some(var) => match resolve_env_value(value) {
            Ok(_) => format!("from ${} (set)", var),
            Err(_) => format!("from ${} {}", var, "(not set)".yellow()),
        },
        None => "(inline value)".to_string(),
    }
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = OrchestratorConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

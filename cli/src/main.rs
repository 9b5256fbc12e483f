// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Cordon CLI
//!
//! The `cordon` binary triggers sandboxed agent executions, inspects their
//! records and runs the orchestration worker daemon.
//!
//! ## Commands
//!
//! - `cordon daemon` - Run the worker pool until SIGINT/SIGTERM
//! - `cordon start workflow|qa` - Trigger an execution and print its ID
//! - `cordon status <id> --tenant <t>` - Show an execution record and its outputs
//! - `cordon agent upload|answer` - Agent callbacks: signed uploads and QA answers
//! - `cordon config show|validate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cordon_core::domain::node_config::OrchestratorConfigManifest;
use cordon_orchestrator::commands::{self, AgentCommand, ConfigCommand, DaemonArgs, StartCommand, StatusArgs};

/// Cordon - sandboxed agent execution orchestrator
#[derive(Parser)]
#[command(name = "cordon")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "CORDON_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to spec.observability.log_level
    #[arg(long, global = true, env = "CORDON_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration worker pool
    #[command(name = "daemon")]
    Daemon(DaemonArgs),

    /// Trigger a sandboxed agent execution
    #[command(name = "start")]
    Start {
        #[command(subcommand)]
        command: StartCommand,
    },

    /// Show an execution record and its output files
    #[command(name = "status")]
    Status(StatusArgs),

    /// Calls an agent makes back to the platform
    #[command(name = "agent")]
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // config commands report load errors themselves
    let command = match cli.command {
        Commands::Config { command } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "text")?;
            return commands::config::handle_command(command, cli.config).await;
        }
        command => command,
    };

    let config = OrchestratorConfigManifest::load_or_default(cli.config)
        .context("Failed to load configuration")?;
    let level = cli
        .log_level
        .unwrap_or_else(|| config.spec.observability.log_level.clone());
    init_logging(&level, &config.spec.observability.log_format)?;

    match command {
        Commands::Daemon(args) => commands::daemon::run(args, config).await,
        Commands::Start { command } => commands::start::run(command, config).await,
        Commands::Status(args) => commands::status::run(args, config).await,
        Commands::Agent { command } => commands::agent::run(command, config).await,
        Commands::Config { .. } => Ok(()),
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}

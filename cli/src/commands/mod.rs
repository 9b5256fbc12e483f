// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Cordon CLI

pub mod agent;
pub mod config;
pub mod daemon;
pub mod start;
pub mod status;

pub use self::agent::AgentCommand;
pub use self::config::ConfigCommand;
pub use self::daemon::DaemonArgs;
pub use self::start::StartCommand;
pub use self::status::StatusArgs;

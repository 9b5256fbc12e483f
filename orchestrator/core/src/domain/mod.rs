// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: aggregates, value objects and the contracts the
//! infrastructure layer implements.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure orchestration model with no I/O of its own

pub mod answer;
pub mod checkpoint;
pub mod clock;
pub mod events;
pub mod execution;
pub mod launcher;
pub mod manifest;
pub mod node_config;
pub mod repository;
pub mod service_account;
pub mod storage;

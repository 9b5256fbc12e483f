// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Cordon orchestrator core
//!
//! Durable orchestration of sandboxed agent executions: one execution is one
//! isolated compute unit holding one short-lived credential, driven through
//! a checkpointed state machine until a single terminal record is written.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, state machine and infrastructure adapters

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;

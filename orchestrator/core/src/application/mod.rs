// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application layer: use cases, the execution state machine and the worker
//! pool that drives it.

pub mod activities;
pub mod agent_callbacks;
pub mod execution_query;
pub mod job_spec;
pub mod result_oracle;
pub mod start_execution;
pub mod state_machine;
pub mod worker;

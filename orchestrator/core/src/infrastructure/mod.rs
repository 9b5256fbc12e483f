// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure layer: adapters for the container runtimes, object
//! storage, PostgreSQL and the in-process event bus.

pub mod credentials;
pub mod db;
pub mod event_bus;
pub mod launcher;
pub mod repositories;
pub mod storage;

pub use credentials::ServiceAccountIssuer;
pub use event_bus::EventBus;

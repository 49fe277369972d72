// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Aegis dispatch core: queue lanes, the run-dispatch engine, and the
//! effect outbox behind the agent runtime.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** admission, claiming, supervision and delivery for agent runs

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;

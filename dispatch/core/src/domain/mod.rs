// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod config;
pub mod control;
pub mod dispatch;
pub mod events;
pub mod lane;
pub mod lease;
pub mod outbox;
pub mod repository;

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod control;
pub mod delivery;
pub mod reaper;
pub mod worker;

pub use control::RuntimeControlService;
pub use delivery::{DeliveryOutcome, EffectDeliveryService, EffectSender};
pub use reaper::LeaseReaper;
pub use worker::{AgentExecutor, DispatchWorker, TurnContext, TurnOutput};

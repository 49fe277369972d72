// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain events emitted by the dispatch core.
//!
//! Published over the in-process event bus for observers (CLI, SSE, audit).
//! Events are descriptive only; no scheduler decision depends on them.

use serde::{Deserialize, Serialize};

use crate::domain::control::ControlEpoch;
use crate::domain::dispatch::{DispatchId, DispatchStatus};
use crate::domain::lane::QueueKey;
use crate::domain::outbox::{EffectId, EffectStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    Claimed {
        dispatch_id: DispatchId,
        queue_key: QueueKey,
        message_count: usize,
        attempt: i32,
    },
    Finalized {
        dispatch_id: DispatchId,
        queue_key: QueueKey,
        status: DispatchStatus,
    },
    StaleEpochRejected {
        dispatch_id: DispatchId,
        expected: ControlEpoch,
        observed: ControlEpoch,
    },
    Reaped {
        dispatch_id: DispatchId,
        queue_key: QueueKey,
    },
    Replayed {
        source_id: DispatchId,
        replay_id: DispatchId,
        already_queued: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EffectEvent {
    Claimed {
        effect_id: EffectId,
        attempt: i32,
    },
    Resolved {
        effect_id: EffectId,
        status: EffectStatus,
    },
    MarkedUnknown {
        effect_id: EffectId,
        reason: String,
    },
}

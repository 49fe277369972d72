// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Queue lanes and queue messages.
//!
//! A lane is the per-session/agent/plugin admission-and-debounce unit: all
//! inbound messages for one dispatch target land on one lane, and at most one
//! run may be active per lane at any time. Lanes are created on the first
//! message to a queue key and reused indefinitely, never deleted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemId(pub Uuid);

impl WorkItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a dispatch target, typically `session:agent:plugin`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueKey(String);

impl QueueKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneState {
    Idle,
    Queued,
    Running,
}

impl LaneState {
    pub fn as_str(self) -> &'static str {
        match self {
            LaneState::Idle => "idle",
            LaneState::Queued => "queued",
            LaneState::Running => "running",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(LaneState::Idle),
            "queued" => Some(LaneState::Queued),
            "running" => Some(LaneState::Running),
            _ => None,
        }
    }
}

/// How bursts of inbound messages map onto dispatches. Fixed when the lane
/// is created; later messages never overwrite it, so the operator/config
/// intent at creation time wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneMode {
    /// Coalesce up to `max_queued` pending messages into one dispatch.
    Collect,
    /// One message per dispatch, strictly oldest-first.
    Followup,
    /// Coalesce like `Collect`, and additionally inject messages arriving
    /// mid-run into the running dispatch via steer directives.
    Steer,
}

impl LaneMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LaneMode::Collect => "collect",
            LaneMode::Followup => "followup",
            LaneMode::Steer => "steer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collect" => Some(LaneMode::Collect),
            "followup" => Some(LaneMode::Followup),
            "steer" => Some(LaneMode::Steer),
            _ => None,
        }
    }
}

/// Debounce window for a lane, rounded up to whole seconds. A message
/// arriving at `t` makes the lane claimable no earlier than `t + window`.
pub fn debounce_window(debounce_ms: i64) -> Duration {
    Duration::seconds((debounce_ms + 999) / 1000)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLane {
    pub queue_key: QueueKey,
    pub session_key: SessionKey,
    pub agent_id: AgentId,
    pub plugin_instance_id: Option<String>,
    pub state: LaneState,
    pub mode: LaneMode,
    pub is_paused: bool,
    pub debounce_until: Option<DateTime<Utc>>,
    pub debounce_ms: i64,
    pub max_queued: i64,
    pub active_dispatch_id: Option<crate::domain::dispatch::DispatchId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueLane {
    /// Whether the lane itself is eligible for claiming at `now`. The claim
    /// transaction re-checks this predicate row-side; this form exists for
    /// candidate ordering and for the in-memory implementation.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == LaneState::Queued
            && !self.is_paused
            && self.debounce_until.map(|t| t <= now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Included,
    Dropped,
    Cancelled,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Included => "included",
            MessageStatus::Dropped => "dropped",
            MessageStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "included" => Some(MessageStatus::Included),
            "dropped" => Some(MessageStatus::Dropped),
            "cancelled" => Some(MessageStatus::Cancelled),
            _ => None,
        }
    }
}

/// One inbound unit (chat message, event) attached to a lane. Status moves
/// one way out of `Pending`; a message is never reopened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: MessageId,
    pub queue_key: QueueKey,
    pub work_item_id: WorkItemId,
    pub text: String,
    pub sender_name: String,
    pub arrived_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub dispatch_id: Option<crate::domain::dispatch::DispatchId>,
}

/// Enqueue request: one message plus the lane attributes used if the lane
/// does not exist yet. Lane attributes are ignored on an existing lane
/// except for pushing `debounce_until` forward.
#[derive(Debug, Clone)]
pub struct NewQueueMessage {
    pub queue_key: QueueKey,
    pub session_key: SessionKey,
    pub agent_id: AgentId,
    pub plugin_instance_id: Option<String>,
    pub work_item_id: WorkItemId,
    pub text: String,
    pub sender_name: String,
    pub arrived_at: DateTime<Utc>,
    pub mode: LaneMode,
    pub debounce_ms: i64,
    pub max_queued: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_window_rounds_up_to_whole_seconds() {
        assert_eq!(debounce_window(0), Duration::seconds(0));
        assert_eq!(debounce_window(1), Duration::seconds(1));
        assert_eq!(debounce_window(999), Duration::seconds(1));
        assert_eq!(debounce_window(1000), Duration::seconds(1));
        assert_eq!(debounce_window(1001), Duration::seconds(2));
        assert_eq!(debounce_window(2500), Duration::seconds(3));
    }

    #[test]
    fn lane_claimable_requires_queued_unpaused_and_due() {
        let now = Utc::now();
        let lane = QueueLane {
            queue_key: QueueKey::new("s1:a1"),
            session_key: SessionKey::new("s1"),
            agent_id: AgentId::new(),
            plugin_instance_id: None,
            state: LaneState::Queued,
            mode: LaneMode::Collect,
            is_paused: false,
            debounce_until: Some(now - Duration::seconds(1)),
            debounce_ms: 1000,
            max_queued: 5,
            active_dispatch_id: None,
            created_at: now,
            updated_at: now,
        };
        assert!(lane.is_claimable(now));

        // An unarmed window counts as due.
        let unarmed = QueueLane { debounce_until: None, ..lane.clone() };
        assert!(unarmed.is_claimable(now));

        let paused = QueueLane { is_paused: true, ..lane.clone() };
        assert!(!paused.is_claimable(now));

        let not_due = QueueLane {
            debounce_until: Some(now + Duration::seconds(5)),
            ..lane.clone()
        };
        assert!(!not_due.is_claimable(now));

        let running = QueueLane { state: LaneState::Running, ..lane };
        assert!(!running.is_claimable(now));
    }
}

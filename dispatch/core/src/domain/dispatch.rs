// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Run dispatches: the unit of scheduled agent work.
//!
//! A dispatch is one attempt to execute agent work for a lane, materialized
//! either from claimed queue messages or from a replay of an earlier
//! dispatch. The state machine is
//! `Queued → Running → Paused → {Completed | Failed | Cancelled | Abandoned}`
//! with all final states terminal; resume parks a paused dispatch back to
//! `Queued` for the next claim cycle. At most one dispatch per queue key may be
//! `Running` at any instant; the claim transaction enforces this.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::control::ControlEpoch;
use crate::domain::lane::{AgentId, MessageId, QueueKey, QueueMessage, SessionKey, WorkItemId};
use crate::domain::lease::Lease;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchId(pub Uuid);

impl DispatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DispatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DispatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job identity bound to a dispatch once execution starts producing a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Abandoned,
}

impl DispatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DispatchStatus::Completed
                | DispatchStatus::Failed
                | DispatchStatus::Cancelled
                | DispatchStatus::Abandoned
        )
    }

    /// Statuses under which a dispatch still occupies its lane.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DispatchStatus::Queued | DispatchStatus::Running | DispatchStatus::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Queued => "queued",
            DispatchStatus::Running => "running",
            DispatchStatus::Paused => "paused",
            DispatchStatus::Completed => "completed",
            DispatchStatus::Failed => "failed",
            DispatchStatus::Cancelled => "cancelled",
            DispatchStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(DispatchStatus::Queued),
            "running" => Some(DispatchStatus::Running),
            "paused" => Some(DispatchStatus::Paused),
            "completed" => Some(DispatchStatus::Completed),
            "failed" => Some(DispatchStatus::Failed),
            "cancelled" => Some(DispatchStatus::Cancelled),
            "abandoned" => Some(DispatchStatus::Abandoned),
            _ => None,
        }
    }
}

/// Cooperative control flags layered over the status. Workers observe these
/// at poll points only; there is no preemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Normal,
    PauseRequested,
    Paused,
    CancelRequested,
    Cancelled,
}

impl ControlState {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlState::Normal => "normal",
            ControlState::PauseRequested => "pause_requested",
            ControlState::Paused => "paused",
            ControlState::CancelRequested => "cancel_requested",
            ControlState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(ControlState::Normal),
            "pause_requested" => Some(ControlState::PauseRequested),
            "paused" => Some(ControlState::Paused),
            "cancel_requested" => Some(ControlState::CancelRequested),
            "cancelled" => Some(ControlState::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDispatch {
    pub id: DispatchId,
    pub run_key: String,
    pub queue_key: QueueKey,
    pub work_item_id: WorkItemId,
    pub agent_id: AgentId,
    pub session_key: SessionKey,
    pub job_id: Option<JobId>,
    pub status: DispatchStatus,
    pub control_state: ControlState,
    pub input_text: String,
    pub coalesced_text: Option<String>,
    pub attempt_count: i32,
    pub lease: Option<Lease>,
    pub claimed_epoch: Option<ControlEpoch>,
    pub replay_of: Option<DispatchId>,
    pub control_reason: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Run key for a dispatch materialized from messages: the lane key plus the
/// id of the newest claimed message. Deterministic, so a crashed claim that
/// is retried against the same messages produces the same key.
pub fn run_key(queue_key: &QueueKey, last_message: MessageId) -> String {
    format!("{}:{}", queue_key, last_message.0)
}

/// Digest of coalesced messages, produced when more than one message is
/// claimed into a dispatch. One `[HH:MM:SS - sender] text` line per message
/// in arrival order, under a fixed header.
pub fn coalesce_digest(messages: &[QueueMessage]) -> String {
    let mut digest = format!("[{} messages arrived while you were working]", messages.len());
    for msg in messages {
        let t = msg.arrived_at.time();
        digest.push_str(&format!(
            "\n[{:02}:{:02}:{:02} - {}] {}",
            t.hour(),
            t.minute(),
            t.second(),
            msg.sender_name,
            msg.text
        ));
    }
    digest
}

/// What the worker is told at each control poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlDirective {
    /// Keep going; nothing to observe.
    Continue,
    /// Stop work at the next safe point without discarding the dispatch;
    /// the worker confirms via `confirm_pause`.
    Pause,
    /// Stop work and finalize as cancelled.
    Cancel,
    /// New messages arrived on a steer-mode lane. The worker weaves these
    /// into the current turn and then marks exactly these ids consumed via
    /// `consume_steered` — two independent steps.
    Steer { messages: Vec<SteerMessage> },
}

/// Snapshot of one pending message handed out with a steer directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteerMessage {
    pub id: MessageId,
    pub text: String,
    pub sender_name: String,
}

impl SteerMessage {
    pub fn from_message(msg: &QueueMessage) -> Self {
        Self {
            id: msg.id,
            text: msg.text.clone(),
            sender_name: msg.sender_name.clone(),
        }
    }
}

/// How a finished run is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    Failed { error: String },
    Cancelled { reason: Option<String> },
}

impl DispatchOutcome {
    pub fn status(&self) -> DispatchStatus {
        match self {
            DispatchOutcome::Completed => DispatchStatus::Completed,
            DispatchOutcome::Failed { .. } => DispatchStatus::Failed,
            DispatchOutcome::Cancelled { .. } => DispatchStatus::Cancelled,
        }
    }
}

/// Replay intent. Resume re-seeds a paused/interrupted run; Retry re-runs a
/// failed or abandoned one. The distinction is carried in `control_reason`
/// so that idempotency dedupes within, not across, the two intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    Resume,
    Retry,
}

impl ReplayMode {
    pub fn reason_tag(self) -> &'static str {
        match self {
            ReplayMode::Resume => "resume_seed",
            ReplayMode::Retry => "retry_replay",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lane::MessageStatus;
    use chrono::TimeZone;

    fn msg(text: &str, sender: &str, at: DateTime<Utc>) -> QueueMessage {
        QueueMessage {
            id: MessageId::new(),
            queue_key: QueueKey::new("s1:a1"),
            work_item_id: WorkItemId::new(),
            text: text.to_string(),
            sender_name: sender.to_string(),
            arrived_at: at,
            status: MessageStatus::Pending,
            dispatch_id: None,
        }
    }

    #[test]
    fn coalesce_digest_lists_messages_in_arrival_order() {
        let t0 = Utc.with_ymd_and_hms(2026, 2, 3, 9, 15, 7).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 2, 3, 9, 15, 42).unwrap();
        let digest = coalesce_digest(&[msg("first", "alice", t0), msg("second", "bob", t1)]);
        assert_eq!(
            digest,
            "[2 messages arrived while you were working]\n\
             [09:15:07 - alice] first\n\
             [09:15:42 - bob] second"
        );
    }

    #[test]
    fn run_key_is_deterministic_for_same_inputs() {
        let key = QueueKey::new("s1:a1");
        let id = MessageId::new();
        assert_eq!(run_key(&key, id), run_key(&key, id));
        assert!(run_key(&key, id).starts_with("s1:a1:"));
    }

    #[test]
    fn terminal_statuses_are_final_and_inactive() {
        for status in [
            DispatchStatus::Completed,
            DispatchStatus::Failed,
            DispatchStatus::Cancelled,
            DispatchStatus::Abandoned,
        ] {
            assert!(status.is_terminal());
            assert!(!status.is_active());
        }
        for status in [
            DispatchStatus::Queued,
            DispatchStatus::Running,
            DispatchStatus::Paused,
        ] {
            assert!(!status.is_terminal());
            assert!(status.is_active());
        }
    }

    #[test]
    fn replay_modes_carry_distinct_reason_tags() {
        assert_eq!(ReplayMode::Resume.reason_tag(), "resume_seed");
        assert_eq!(ReplayMode::Retry.reason_tag(), "retry_replay");
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            DispatchStatus::Queued,
            DispatchStatus::Running,
            DispatchStatus::Paused,
            DispatchStatus::Completed,
            DispatchStatus::Failed,
            DispatchStatus::Cancelled,
            DispatchStatus::Abandoned,
        ] {
            assert_eq!(DispatchStatus::parse(status.as_str()), Some(status));
        }
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Effect outbox: durable obligations to perform external side effects.
//!
//! Each entry is one external, generally non-idempotent call (a chat
//! delivery, a media post). Entries are claimed and delivered separately
//! from the run that produced them, fenced by the same control epoch. The
//! failure model preserves ambiguity: when the true outcome of a call cannot
//! be determined, the entry parks in `Unknown` and is never auto-retried —
//! retrying could double-deliver an effect that already landed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::control::ControlEpoch;
use crate::domain::dispatch::DispatchId;
use crate::domain::lane::{SessionKey, WorkItemId};
use crate::domain::lease::Lease;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectId(pub Uuid);

impl EffectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EffectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EffectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The effect to perform. A tagged union in the domain; serialized as JSON
/// only at the storage boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EffectPayload {
    ChatMessage {
        session_key: SessionKey,
        text: String,
    },
    MediaPost {
        session_key: SessionKey,
        media_url: String,
        caption: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Unknown,
    Cancelled,
}

impl EffectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectStatus::Pending => "pending",
            EffectStatus::Sending => "sending",
            EffectStatus::Sent => "sent",
            EffectStatus::Failed => "failed",
            EffectStatus::Unknown => "unknown",
            EffectStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EffectStatus::Pending),
            "sending" => Some(EffectStatus::Sending),
            "sent" => Some(EffectStatus::Sent),
            "failed" => Some(EffectStatus::Failed),
            "unknown" => Some(EffectStatus::Unknown),
            "cancelled" => Some(EffectStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectOutboxEntry {
    pub id: EffectId,
    pub work_item_id: WorkItemId,
    pub dispatch_id: DispatchId,
    pub payload: EffectPayload,
    pub status: EffectStatus,
    pub retryable: bool,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub lease: Option<Lease>,
    pub claimed_epoch: Option<ControlEpoch>,
    pub provider_ref: Option<String>,
    pub last_error: Option<String>,
    pub unknown_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl EffectOutboxEntry {
    /// Whether the entry is eligible for `claim_next` at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EffectStatus::Pending => true,
            EffectStatus::Failed => {
                self.retryable && self.next_attempt_at.map(|t| t <= now).unwrap_or(true)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewEffect {
    pub work_item_id: WorkItemId,
    pub dispatch_id: DispatchId,
    pub payload: EffectPayload,
}

/// Retry delay after `attempt_count` attempts: exponential from a base,
/// capped.
pub fn retry_backoff(attempt_count: i32, base: Duration, cap: Duration) -> Duration {
    let exp = attempt_count.saturating_sub(1).clamp(0, 16) as u32;
    let delay = base * 2i32.saturating_pow(exp);
    if delay > cap {
        cap
    } else {
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::seconds(5);
        let cap = Duration::seconds(300);
        assert_eq!(retry_backoff(1, base, cap), Duration::seconds(5));
        assert_eq!(retry_backoff(2, base, cap), Duration::seconds(10));
        assert_eq!(retry_backoff(3, base, cap), Duration::seconds(20));
        assert_eq!(retry_backoff(7, base, cap), Duration::seconds(300));
        assert_eq!(retry_backoff(40, base, cap), Duration::seconds(300));
    }

    #[test]
    fn only_pending_and_due_retryable_failures_are_claimable() {
        let now = Utc::now();
        let entry = EffectOutboxEntry {
            id: EffectId::new(),
            work_item_id: WorkItemId::new(),
            dispatch_id: DispatchId::new(),
            payload: EffectPayload::ChatMessage {
                session_key: SessionKey::new("s1"),
                text: "hi".into(),
            },
            status: EffectStatus::Pending,
            retryable: true,
            next_attempt_at: None,
            attempt_count: 0,
            lease: None,
            claimed_epoch: None,
            provider_ref: None,
            last_error: None,
            unknown_reason: None,
            created_at: now,
            sent_at: None,
        };
        assert!(entry.is_claimable(now));

        let failed_due = EffectOutboxEntry {
            status: EffectStatus::Failed,
            next_attempt_at: Some(now - Duration::seconds(1)),
            ..entry.clone()
        };
        assert!(failed_due.is_claimable(now));

        let failed_not_due = EffectOutboxEntry {
            status: EffectStatus::Failed,
            next_attempt_at: Some(now + Duration::seconds(60)),
            ..entry.clone()
        };
        assert!(!failed_not_due.is_claimable(now));

        let failed_terminal = EffectOutboxEntry {
            status: EffectStatus::Failed,
            retryable: false,
            ..entry.clone()
        };
        assert!(!failed_terminal.is_claimable(now));

        for status in [EffectStatus::Sending, EffectStatus::Sent, EffectStatus::Unknown, EffectStatus::Cancelled] {
            let e = EffectOutboxEntry { status, ..entry.clone() };
            assert!(!e.is_claimable(now));
        }
    }

    #[test]
    fn payload_serializes_as_tagged_union() {
        let payload = EffectPayload::MediaPost {
            session_key: SessionKey::new("s1"),
            media_url: "https://example.com/cat.png".into(),
            caption: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "media_post");
        let back: EffectPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}

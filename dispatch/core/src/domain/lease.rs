// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lease value types.
//!
//! A lease is a time-bounded claim on a dispatch or an outbox entry. Leases
//! are deliberately a distinct type rather than a bare timestamp so that a
//! lease deadline can never be confused with a control epoch or any other
//! `DateTime` column floating through the scheduler.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a worker process holding a claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A time-bounded claim held by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn acquire(holder: WorkerId, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Extend the lease deadline. The holder is unchanged; heartbeats never
    /// transfer ownership.
    pub fn extend(&self, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder: self.holder.clone(),
            expires_at: now + ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_expiry_is_inclusive_of_deadline() {
        let now = Utc::now();
        let lease = Lease::acquire(WorkerId::new("w1"), Duration::seconds(30), now);
        assert!(!lease.is_expired(now));
        assert!(!lease.is_expired(now + Duration::seconds(29)));
        assert!(lease.is_expired(now + Duration::seconds(30)));
    }

    #[test]
    fn extend_keeps_holder() {
        let now = Utc::now();
        let lease = Lease::acquire(WorkerId::new("w1"), Duration::seconds(5), now);
        let extended = lease.extend(Duration::seconds(60), now + Duration::seconds(4));
        assert_eq!(extended.holder, lease.holder);
        assert!(extended.expires_at > lease.expires_at);
    }
}

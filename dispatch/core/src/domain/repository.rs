// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the dispatch core, following the DDD Repository
//! pattern: interfaces defined in the domain layer, implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `RuntimeControlRepository` | `RuntimeControl` | `InMemoryDispatchStore`, `PostgresRuntimeControlRepository` |
//! | `QueueLaneRepository` | `QueueLane` + `QueueMessage` | `InMemoryDispatchStore`, `PostgresQueueLaneRepository` |
//! | `RunDispatchRepository` | `RunDispatch` | `InMemoryDispatchStore`, `PostgresRunDispatchRepository` |
//! | `EffectOutboxRepository` | `EffectOutboxEntry` | `InMemoryDispatchStore`, `PostgresEffectOutboxRepository` |
//!
//! All coordination between workers happens through these operations as
//! conditional updates whose WHERE clause encodes the exact expected prior
//! state. A lost race therefore surfaces as a sentinel value (`None`,
//! `false`, `LostRace`) — never as an error and never as a stale read.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::control::{ControlEpoch, PauseMode, RuntimeControl};
use crate::domain::dispatch::{
    ControlDirective, DispatchId, DispatchOutcome, JobId, ReplayMode, RunDispatch,
};
use crate::domain::lane::{MessageId, NewQueueMessage, QueueKey, QueueLane, QueueMessage};
use crate::domain::lease::WorkerId;
use crate::domain::outbox::{EffectId, EffectOutboxEntry, NewEffect};

/// A successful dispatch claim: the dispatch now Running plus the messages
/// included into it, in arrival order. Empty `messages` means the claim
/// picked up a pre-existing queued dispatch (a replay seed).
#[derive(Debug, Clone)]
pub struct ClaimedDispatch {
    pub dispatch: RunDispatch,
    pub messages: Vec<QueueMessage>,
}

/// Result of an epoch-checked finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeResult {
    /// The dispatch was finalized and its lane recomputed.
    Applied,
    /// The live control epoch no longer matches the expected one. Nothing
    /// was mutated; the caller must discard pending side effects.
    StaleEpoch {
        expected: ControlEpoch,
        observed: ControlEpoch,
    },
    /// The dispatch already left the finalizable states (another actor got
    /// there first, or the reaper did). Nothing was mutated.
    LostRace,
}

/// Result of an epoch-checked outbox mark operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectMarkResult {
    Applied,
    StaleEpoch {
        expected: ControlEpoch,
        observed: ControlEpoch,
    },
    /// The entry is no longer `Sending`; the mark did not take effect.
    LostRace,
}

/// Outcome of a replay request. `already_queued` is true when an active
/// replay with the same reason tag already existed and was returned instead
/// of inserting a duplicate.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub dispatch: RunDispatch,
    pub already_queued: bool,
}

/// One dispatch transitioned to `Abandoned` by a reaper sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedDispatch {
    pub dispatch_id: DispatchId,
    pub queue_key: QueueKey,
}

/// Repository for the singleton `RuntimeControl` row.
#[async_trait]
pub trait RuntimeControlRepository: Send + Sync {
    /// Fetch the singleton, creating it idempotently if absent.
    async fn get_or_init(&self) -> Result<RuntimeControl, RepositoryError>;

    /// The live fencing epoch.
    async fn current_epoch(&self) -> Result<ControlEpoch, RepositoryError>;

    /// Strictly increment the fencing epoch, voiding all claims stamped with
    /// earlier epochs. Returns the new value.
    async fn bump_epoch(&self) -> Result<ControlEpoch, RepositoryError>;

    async fn set_processing_enabled(
        &self,
        enabled: bool,
        mode: PauseMode,
    ) -> Result<RuntimeControl, RepositoryError>;

    async fn set_max_concurrent_dispatches(
        &self,
        limit: i32,
    ) -> Result<RuntimeControl, RepositoryError>;
}

/// Repository for queue lanes and their messages.
#[async_trait]
pub trait QueueLaneRepository: Send + Sync {
    /// Insert the message and upsert its lane (create with the request's
    /// attributes, or push `debounce_until` forward) in one transaction.
    /// A running lane is never downgraded by an arriving message.
    async fn enqueue_message(&self, msg: NewQueueMessage)
        -> Result<QueueMessage, RepositoryError>;

    async fn find_lane(&self, key: &QueueKey) -> Result<Option<QueueLane>, RepositoryError>;

    /// Pending messages for a lane, oldest first.
    async fn pending_messages(&self, key: &QueueKey)
        -> Result<Vec<QueueMessage>, RepositoryError>;

    /// Returns false if the lane does not exist.
    async fn pause_lane(&self, key: &QueueKey) -> Result<bool, RepositoryError>;

    /// Unpause; recomputes `state` from `active_dispatch_id` and re-arms
    /// `debounce_until` if it was cleared. Returns false if the lane does
    /// not exist.
    async fn resume_lane(&self, key: &QueueKey) -> Result<bool, RepositoryError>;
}

/// Repository for run dispatches — the scheduler proper.
#[async_trait]
pub trait RunDispatchRepository: Send + Sync {
    /// Claim the next eligible lane and materialize a dispatch from its
    /// pending messages (or pick up a queued replay seed). `None` means no
    /// work, a lost race, or global admission gating — all expected; the
    /// caller retries on its next poll.
    async fn claim_next(
        &self,
        worker: &WorkerId,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedDispatch>, RepositoryError>;

    /// Extend the lease while the dispatch is Running/Paused and still held
    /// by `worker`. Returns false when the lease was lost (reaped or
    /// reassigned); the worker must stop and not finalize.
    async fn heartbeat(
        &self,
        id: DispatchId,
        worker: &WorkerId,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// What the worker should do next: Continue, Pause, Cancel, or Steer
    /// with ordered pending-message snapshots (steer-mode lanes only).
    async fn control_directive(
        &self,
        id: DispatchId,
    ) -> Result<ControlDirective, RepositoryError>;

    /// Mark exactly the given pending messages as included in this dispatch.
    /// Returns how many rows actually moved; ids already consumed elsewhere
    /// are skipped, not errors.
    async fn consume_steered(
        &self,
        id: DispatchId,
        message_ids: &[MessageId],
    ) -> Result<usize, RepositoryError>;

    /// Bind the job produced by execution. Set-once.
    async fn bind_job(&self, id: DispatchId, job_id: JobId) -> Result<bool, RepositoryError>;

    /// Request a cooperative pause of the dispatch bound to `job_id`.
    /// Idempotent and guarded; false means the dispatch already left the
    /// expected state and the request did not take effect.
    async fn request_pause_by_job(&self, job_id: &JobId) -> Result<bool, RepositoryError>;

    /// Worker acknowledgment that it stopped at a safe point. Clears the
    /// lease: a parked pause is owned by no worker and is never reaped.
    async fn confirm_pause(&self, id: DispatchId) -> Result<bool, RepositoryError>;

    /// Park a paused dispatch back to Queued and re-arm its lane so the
    /// next claim cycle adopts it as a seed.
    async fn resume_by_job(&self, job_id: &JobId) -> Result<bool, RepositoryError>;

    async fn request_cancel_by_job(&self, job_id: &JobId) -> Result<bool, RepositoryError>;

    /// Epoch-checked finalize. `expected_epoch` defaults to the dispatch's
    /// `claimed_epoch`; a mismatch against the live epoch aborts without
    /// mutating anything. On success the lane is recomputed to Queued (with
    /// a re-armed debounce) or Idle.
    async fn finalize(
        &self,
        id: DispatchId,
        outcome: DispatchOutcome,
        expected_epoch: Option<ControlEpoch>,
    ) -> Result<FinalizeResult, RepositoryError>;

    /// Sweep Running/Paused dispatches whose lease lapsed into `Abandoned`
    /// and free their lanes. Idempotent under repeated sweeps.
    async fn reap_expired(&self, now: DateTime<Utc>)
        -> Result<Vec<ReapedDispatch>, RepositoryError>;

    /// Re-materialize a dispatch. Idempotent per source and reason tag: an
    /// active replay with the same tag is returned unchanged.
    async fn replay(
        &self,
        source_id: DispatchId,
        actor: &str,
        reason: &str,
        mode: ReplayMode,
    ) -> Result<ReplayOutcome, RepositoryError>;

    async fn find_by_id(&self, id: DispatchId) -> Result<Option<RunDispatch>, RepositoryError>;
}

/// Repository for the effect outbox.
#[async_trait]
pub trait EffectOutboxRepository: Send + Sync {
    async fn enqueue(&self, effect: NewEffect) -> Result<EffectOutboxEntry, RepositoryError>;

    /// Claim the oldest deliverable entry (Pending, or retryable Failed
    /// whose `next_attempt_at` is due): move it to Sending with a fresh
    /// lease, a bumped attempt count, and the live epoch stamped. `None`
    /// means nothing to do or a lost race.
    async fn claim_next(
        &self,
        worker: &WorkerId,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<EffectOutboxEntry>, RepositoryError>;

    /// Record a confirmed delivery. Requires Sending; when `expected_epoch`
    /// is given it is re-checked against the live epoch first.
    async fn mark_sent(
        &self,
        id: EffectId,
        provider_ref: &str,
        expected_epoch: Option<ControlEpoch>,
    ) -> Result<EffectMarkResult, RepositoryError>;

    /// Record a definite failure. `retry_at` present means the failure is
    /// confidently retryable and the entry becomes claimable again at that
    /// time; absent means terminal-until-operator.
    async fn mark_failed(
        &self,
        id: EffectId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        expected_epoch: Option<ControlEpoch>,
    ) -> Result<EffectMarkResult, RepositoryError>;

    /// Record an ambiguous outcome. Unknown entries are never auto-retried;
    /// only `release_unknown` or `cancel` moves them.
    async fn mark_unknown(
        &self,
        id: EffectId,
        reason: &str,
        expected_epoch: Option<ControlEpoch>,
    ) -> Result<EffectMarkResult, RepositoryError>;

    /// Operator release of an Unknown entry back to Pending.
    async fn release_unknown(&self, id: EffectId) -> Result<bool, RepositoryError>;

    /// Cancel a not-yet-sent entry (Pending, Failed or Unknown).
    async fn cancel(&self, id: EffectId) -> Result<bool, RepositoryError>;

    /// Bulk-cancel the not-yet-sent entries of an invalidated dispatch.
    /// Returns how many were cancelled.
    async fn cancel_pending_by_dispatch(
        &self,
        dispatch_id: DispatchId,
    ) -> Result<u64, RepositoryError>;

    /// Crash recovery: move Sending entries whose lease lapsed (or never
    /// existed) to Unknown — not back to Pending, preserving at-most-once
    /// on ambiguity. Returns how many moved.
    async fn mark_stale_sending_unknown(&self, now: DateTime<Utc>)
        -> Result<u64, RepositoryError>;

    async fn find_by_id(&self, id: EffectId)
        -> Result<Option<EffectOutboxEntry>, RepositoryError>;

    /// Entries belonging to a dispatch, oldest first.
    async fn find_by_dispatch(
        &self,
        dispatch_id: DispatchId,
    ) -> Result<Vec<EffectOutboxEntry>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

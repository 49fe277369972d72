// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstractions defined in
//! the domain layer, following the Repository pattern from DDD.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and coordinate dispatch-core aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! Production implementations backed by PostgreSQL. Every claim-style
//! operation is a conditional UPDATE whose WHERE clause encodes the exact
//! expected prior row state, executed inside a transaction, with the
//! affected-row count as the success signal — optimistic concurrency, no
//! explicit row locks.
//!
//! - **PostgresRuntimeControlRepository** - singleton control row + epoch
//! - **PostgresQueueLaneRepository** - lane upsert + message lifecycle
//! - **PostgresRunDispatchRepository** - claim/finalize/reap/replay engine
//! - **PostgresEffectOutboxRepository** - fenced effect delivery queue
//!
//! ## In-Memory Store
//!
//! **InMemoryDispatchStore** implements all four traits over a single mutex
//! so cross-table operations (claim, finalize) stay atomic, mirroring the
//! transactional semantics of the PostgreSQL implementations exactly. Used
//! for testing and development.

pub mod postgres_control;
pub mod postgres_dispatch;
pub mod postgres_lane;
pub mod postgres_outbox;

pub use postgres_control::PostgresRuntimeControlRepository;
pub use postgres_dispatch::PostgresRunDispatchRepository;
pub use postgres_lane::PostgresQueueLaneRepository;
pub use postgres_outbox::PostgresEffectOutboxRepository;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::control::{ControlEpoch, PauseMode, RuntimeControl};
use crate::domain::dispatch::{
    coalesce_digest, run_key, ControlDirective, ControlState, DispatchId, DispatchOutcome,
    DispatchStatus, JobId, ReplayMode, RunDispatch, SteerMessage,
};
use crate::domain::lane::{
    debounce_window, LaneState, MessageId, MessageStatus, NewQueueMessage, QueueKey, QueueLane,
    QueueMessage,
};
use crate::domain::lease::{Lease, WorkerId};
use crate::domain::outbox::{EffectId, EffectOutboxEntry, EffectStatus, NewEffect};
use crate::domain::repository::{
    ClaimedDispatch, EffectMarkResult, EffectOutboxRepository, FinalizeResult,
    QueueLaneRepository, ReapedDispatch, ReplayOutcome, RepositoryError, RunDispatchRepository,
    RuntimeControlRepository,
};

#[derive(Default)]
struct StoreInner {
    control: Option<RuntimeControl>,
    lanes: HashMap<QueueKey, QueueLane>,
    messages: Vec<QueueMessage>,
    dispatches: HashMap<DispatchId, RunDispatch>,
    effects: Vec<EffectOutboxEntry>,
}

impl StoreInner {
    fn control_mut(&mut self) -> &mut RuntimeControl {
        self.control.get_or_insert_with(RuntimeControl::default)
    }

    fn epoch(&mut self) -> ControlEpoch {
        self.control_mut().control_epoch
    }

    /// Pending message indices for a lane, oldest first (arrival order,
    /// insertion order for ties).
    fn pending_indices(&self, key: &QueueKey) -> Vec<usize> {
        let mut idx: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| &m.queue_key == key && m.status == MessageStatus::Pending)
            .map(|(i, _)| i)
            .collect();
        idx.sort_by_key(|&i| self.messages[i].arrived_at);
        idx
    }

    fn has_running_dispatch(&self, key: &QueueKey) -> bool {
        self.dispatches
            .values()
            .any(|d| &d.queue_key == key && d.status == DispatchStatus::Running)
    }

    fn queued_dispatch_id(&self, key: &QueueKey) -> Option<DispatchId> {
        let mut queued: Vec<&RunDispatch> = self
            .dispatches
            .values()
            .filter(|d| &d.queue_key == key && d.status == DispatchStatus::Queued)
            .collect();
        queued.sort_by_key(|d| d.created_at);
        queued.first().map(|d| d.id)
    }

    /// Re-derive a lane's scheduling state after its active dispatch left
    /// the running/paused set.
    fn settle_lane(&mut self, key: &QueueKey, now: DateTime<Utc>) {
        let has_pending = !self.pending_indices(key).is_empty();
        let has_queued_dispatch = self.queued_dispatch_id(key).is_some();
        if let Some(lane) = self.lanes.get_mut(key) {
            lane.active_dispatch_id = None;
            if has_pending || has_queued_dispatch {
                lane.state = LaneState::Queued;
                lane.debounce_until = Some(now + debounce_window(lane.debounce_ms));
            } else {
                lane.state = LaneState::Idle;
                lane.debounce_until = None;
            }
            lane.updated_at = now;
        }
    }
}

/// In-memory implementation of the entire dispatch store. All four
/// repository traits are implemented on clones of one shared handle; a
/// single mutex plays the role of the database transaction.
#[derive(Clone, Default)]
pub struct InMemoryDispatchStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryDispatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuntimeControlRepository for InMemoryDispatchStore {
    async fn get_or_init(&self) -> Result<RuntimeControl, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.control_mut().clone())
    }

    async fn current_epoch(&self) -> Result<ControlEpoch, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.epoch())
    }

    async fn bump_epoch(&self) -> Result<ControlEpoch, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let control = inner.control_mut();
        control.control_epoch = control.control_epoch.next();
        Ok(control.control_epoch)
    }

    async fn set_processing_enabled(
        &self,
        enabled: bool,
        mode: PauseMode,
    ) -> Result<RuntimeControl, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let control = inner.control_mut();
        control.processing_enabled = enabled;
        control.pause_mode = mode;
        Ok(control.clone())
    }

    async fn set_max_concurrent_dispatches(
        &self,
        limit: i32,
    ) -> Result<RuntimeControl, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let control = inner.control_mut();
        control.max_concurrent_dispatches = limit;
        Ok(control.clone())
    }
}

#[async_trait]
impl QueueLaneRepository for InMemoryDispatchStore {
    async fn enqueue_message(
        &self,
        msg: NewQueueMessage,
    ) -> Result<QueueMessage, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let arrived_at = msg.arrived_at;
        let armed_until = arrived_at + debounce_window(msg.debounce_ms);

        match inner.lanes.get_mut(&msg.queue_key) {
            Some(lane) => {
                // Mode and lane attributes are fixed at creation; arrivals
                // only push the debounce window forward and never downgrade
                // a running lane.
                let armed = arrived_at + debounce_window(lane.debounce_ms);
                lane.debounce_until = Some(match lane.debounce_until {
                    Some(current) if current > armed => current,
                    _ => armed,
                });
                if lane.state == LaneState::Idle {
                    lane.state = LaneState::Queued;
                }
                lane.updated_at = arrived_at;
            }
            None => {
                inner.lanes.insert(
                    msg.queue_key.clone(),
                    QueueLane {
                        queue_key: msg.queue_key.clone(),
                        session_key: msg.session_key.clone(),
                        agent_id: msg.agent_id,
                        plugin_instance_id: msg.plugin_instance_id.clone(),
                        state: LaneState::Queued,
                        mode: msg.mode,
                        is_paused: false,
                        debounce_until: Some(armed_until),
                        debounce_ms: msg.debounce_ms,
                        max_queued: msg.max_queued,
                        active_dispatch_id: None,
                        created_at: arrived_at,
                        updated_at: arrived_at,
                    },
                );
            }
        }

        let message = QueueMessage {
            id: MessageId::new(),
            queue_key: msg.queue_key,
            work_item_id: msg.work_item_id,
            text: msg.text,
            sender_name: msg.sender_name,
            arrived_at,
            status: MessageStatus::Pending,
            dispatch_id: None,
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn find_lane(&self, key: &QueueKey) -> Result<Option<QueueLane>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.lanes.get(key).cloned())
    }

    async fn pending_messages(
        &self,
        key: &QueueKey,
    ) -> Result<Vec<QueueMessage>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pending_indices(key)
            .into_iter()
            .map(|i| inner.messages[i].clone())
            .collect())
    }

    async fn pause_lane(&self, key: &QueueKey) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.lanes.get_mut(key) {
            Some(lane) => {
                lane.is_paused = true;
                lane.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn resume_lane(&self, key: &QueueKey) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let has_pending = !inner.pending_indices(key).is_empty();
        match inner.lanes.get_mut(key) {
            Some(lane) => {
                lane.is_paused = false;
                lane.state = if lane.active_dispatch_id.is_some() {
                    LaneState::Running
                } else if has_pending {
                    LaneState::Queued
                } else {
                    LaneState::Idle
                };
                if lane.state == LaneState::Queued && lane.debounce_until.is_none() {
                    lane.debounce_until = Some(now + debounce_window(lane.debounce_ms));
                }
                lane.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl RunDispatchRepository for InMemoryDispatchStore {
    async fn claim_next(
        &self,
        worker: &WorkerId,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedDispatch>, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();

        let control = inner.control_mut().clone();
        if !control.processing_enabled {
            return Ok(None);
        }
        let running = inner
            .dispatches
            .values()
            .filter(|d| d.status == DispatchStatus::Running)
            .count();
        if running as i32 >= control.max_concurrent_dispatches {
            return Ok(None);
        }

        // Phase 1: candidate lane, earliest-ready-first, deterministic.
        let mut candidates: Vec<(DateTime<Utc>, QueueKey)> = inner
            .lanes
            .values()
            .filter(|l| l.is_claimable(now) && !inner.has_running_dispatch(&l.queue_key))
            .map(|l| {
                (
                    l.debounce_until.unwrap_or(DateTime::<Utc>::MIN_UTC),
                    l.queue_key.clone(),
                )
            })
            .collect();
        candidates.sort();
        let Some((_, key)) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let (mode, max_queued) = {
            let lane = inner.lanes.get_mut(&key).expect("candidate lane exists");
            lane.state = LaneState::Running;
            lane.updated_at = now;
            (lane.mode, lane.max_queued)
        };

        // Phase 2: messages, or a queued replay seed, or nothing.
        let pending = inner.pending_indices(&key);
        let take = match mode {
            crate::domain::lane::LaneMode::Followup => 1,
            _ => max_queued.max(1) as usize,
        };
        let claimed: Vec<usize> = pending.into_iter().take(take).collect();

        if claimed.is_empty() {
            if let Some(dispatch_id) = inner.queued_dispatch_id(&key) {
                let epoch = inner.epoch();
                let dispatch = inner.dispatches.get_mut(&dispatch_id).unwrap();
                dispatch.status = DispatchStatus::Running;
                dispatch.attempt_count += 1;
                dispatch.lease = Some(Lease::acquire(worker.clone(), lease_ttl, now));
                dispatch.claimed_epoch = Some(epoch);
                dispatch.started_at = Some(now);
                let dispatch = dispatch.clone();
                let lane = inner.lanes.get_mut(&key).unwrap();
                lane.active_dispatch_id = Some(dispatch_id);
                return Ok(Some(ClaimedDispatch {
                    dispatch,
                    messages: Vec::new(),
                }));
            }
            let lane = inner.lanes.get_mut(&key).unwrap();
            lane.state = LaneState::Idle;
            lane.debounce_until = None;
            return Ok(None);
        }

        let epoch = inner.epoch();
        let id = DispatchId::new();
        let messages: Vec<QueueMessage> =
            claimed.iter().map(|&i| inner.messages[i].clone()).collect();
        let last = messages.last().expect("claimed is non-empty");
        let lane = inner.lanes.get(&key).unwrap().clone();

        let dispatch = RunDispatch {
            id,
            run_key: run_key(&key, last.id),
            queue_key: key.clone(),
            work_item_id: last.work_item_id,
            agent_id: lane.agent_id,
            session_key: lane.session_key.clone(),
            job_id: None,
            status: DispatchStatus::Running,
            control_state: ControlState::Normal,
            input_text: last.text.clone(),
            coalesced_text: if messages.len() > 1
                && mode != crate::domain::lane::LaneMode::Followup
            {
                Some(coalesce_digest(&messages))
            } else {
                None
            },
            attempt_count: 1,
            lease: Some(Lease::acquire(worker.clone(), lease_ttl, now)),
            claimed_epoch: Some(epoch),
            replay_of: None,
            control_reason: None,
            last_error: None,
            created_at: now,
            started_at: Some(now),
            finished_at: None,
        };

        for &i in &claimed {
            inner.messages[i].status = MessageStatus::Included;
            inner.messages[i].dispatch_id = Some(id);
        }
        inner.dispatches.insert(id, dispatch.clone());
        let lane = inner.lanes.get_mut(&key).unwrap();
        lane.active_dispatch_id = Some(id);

        Ok(Some(ClaimedDispatch { dispatch, messages }))
    }

    async fn heartbeat(
        &self,
        id: DispatchId,
        worker: &WorkerId,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.dispatches.get_mut(&id) {
            Some(d)
                if matches!(d.status, DispatchStatus::Running | DispatchStatus::Paused)
                    && d.lease.as_ref().map(|l| &l.holder) == Some(worker) =>
            {
                d.lease = Some(Lease::acquire(worker.clone(), lease_ttl, now));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn control_directive(
        &self,
        id: DispatchId,
    ) -> Result<ControlDirective, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        let Some(d) = inner.dispatches.get(&id) else {
            return Err(RepositoryError::NotFound(format!("dispatch {id}")));
        };

        if d.status.is_terminal()
            || matches!(
                d.control_state,
                ControlState::CancelRequested | ControlState::Cancelled
            )
        {
            return Ok(ControlDirective::Cancel);
        }
        if d.status == DispatchStatus::Paused || d.control_state == ControlState::PauseRequested {
            return Ok(ControlDirective::Pause);
        }

        if let Some(lane) = inner.lanes.get(&d.queue_key) {
            if lane.mode == crate::domain::lane::LaneMode::Steer {
                let pending: Vec<SteerMessage> = inner
                    .pending_indices(&d.queue_key)
                    .into_iter()
                    .map(|i| SteerMessage::from_message(&inner.messages[i]))
                    .collect();
                if !pending.is_empty() {
                    return Ok(ControlDirective::Steer { messages: pending });
                }
            }
        }

        Ok(ControlDirective::Continue)
    }

    async fn consume_steered(
        &self,
        id: DispatchId,
        message_ids: &[MessageId],
    ) -> Result<usize, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(queue_key) = inner.dispatches.get(&id).map(|d| d.queue_key.clone()) else {
            return Err(RepositoryError::NotFound(format!("dispatch {id}")));
        };
        let mut consumed = 0;
        for msg in inner.messages.iter_mut() {
            if message_ids.contains(&msg.id)
                && msg.queue_key == queue_key
                && msg.status == MessageStatus::Pending
            {
                msg.status = MessageStatus::Included;
                msg.dispatch_id = Some(id);
                consumed += 1;
            }
        }
        Ok(consumed)
    }

    async fn bind_job(&self, id: DispatchId, job_id: JobId) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.dispatches.get_mut(&id) {
            Some(d) if d.job_id.is_none() && d.status.is_active() => {
                d.job_id = Some(job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn request_pause_by_job(&self, job_id: &JobId) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let hit = inner.dispatches.values_mut().find(|d| {
            d.job_id.as_ref() == Some(job_id)
                && matches!(d.status, DispatchStatus::Queued | DispatchStatus::Running)
                && d.control_state == ControlState::Normal
        });
        match hit {
            Some(d) => {
                d.control_state = ControlState::PauseRequested;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn confirm_pause(&self, id: DispatchId) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.dispatches.get_mut(&id) {
            Some(d)
                if d.status == DispatchStatus::Running
                    && d.control_state == ControlState::PauseRequested =>
            {
                d.status = DispatchStatus::Paused;
                d.control_state = ControlState::Paused;
                // A parked pause is owned by no worker; with the lease
                // cleared the reaper leaves it alone indefinitely.
                d.lease = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resume_by_job(&self, job_id: &JobId) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let hit = inner
            .dispatches
            .values_mut()
            .find(|d| d.job_id.as_ref() == Some(job_id) && d.status == DispatchStatus::Paused);
        let Some(d) = hit else {
            return Ok(false);
        };
        // No worker supervises a paused dispatch, so resume parks it back
        // to queued and the next claim cycle adopts it as a seed.
        d.status = DispatchStatus::Queued;
        d.control_state = ControlState::Normal;
        d.lease = None;
        let queue_key = d.queue_key.clone();
        if let Some(lane) = inner.lanes.get_mut(&queue_key) {
            lane.state = LaneState::Queued;
            lane.debounce_until = Some(now);
            lane.active_dispatch_id = None;
            lane.updated_at = now;
        }
        Ok(true)
    }

    async fn request_cancel_by_job(&self, job_id: &JobId) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let hit = inner.dispatches.values_mut().find(|d| {
            d.job_id.as_ref() == Some(job_id)
                && d.status.is_active()
                && !matches!(
                    d.control_state,
                    ControlState::CancelRequested | ControlState::Cancelled
                )
        });
        match hit {
            Some(d) => {
                d.control_state = ControlState::CancelRequested;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finalize(
        &self,
        id: DispatchId,
        outcome: DispatchOutcome,
        expected_epoch: Option<ControlEpoch>,
    ) -> Result<FinalizeResult, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let observed = inner.epoch();
        let now = Utc::now();

        let Some(d) = inner.dispatches.get(&id) else {
            return Err(RepositoryError::NotFound(format!("dispatch {id}")));
        };
        let expected = expected_epoch.or(d.claimed_epoch);
        if let Some(expected) = expected {
            if expected != observed {
                return Ok(FinalizeResult::StaleEpoch { expected, observed });
            }
        }
        if !matches!(d.status, DispatchStatus::Running | DispatchStatus::Paused)
            || d.claimed_epoch != expected
        {
            return Ok(FinalizeResult::LostRace);
        }

        let queue_key = d.queue_key.clone();
        let d = inner.dispatches.get_mut(&id).unwrap();
        d.status = outcome.status();
        match &outcome {
            DispatchOutcome::Completed => {}
            DispatchOutcome::Failed { error } => d.last_error = Some(error.clone()),
            DispatchOutcome::Cancelled { reason } => {
                d.control_state = ControlState::Cancelled;
                d.control_reason = reason.clone().or(d.control_reason.take());
            }
        }
        d.lease = None;
        d.finished_at = Some(now);

        inner.settle_lane(&queue_key, now);
        Ok(FinalizeResult::Applied)
    }

    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReapedDispatch>, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<DispatchId> = inner
            .dispatches
            .values()
            .filter(|d| {
                matches!(d.status, DispatchStatus::Running | DispatchStatus::Paused)
                    && d.lease.as_ref().map(|l| l.is_expired(now)).unwrap_or(false)
            })
            .map(|d| d.id)
            .collect();

        let mut reaped = Vec::new();
        for id in expired {
            let d = inner.dispatches.get_mut(&id).unwrap();
            d.status = DispatchStatus::Abandoned;
            d.control_state = ControlState::Cancelled;
            d.last_error = Some("lease expired; worker presumed dead".to_string());
            d.lease = None;
            d.finished_at = Some(now);
            let queue_key = d.queue_key.clone();
            inner.settle_lane(&queue_key, now);
            reaped.push(ReapedDispatch {
                dispatch_id: id,
                queue_key,
            });
        }
        Ok(reaped)
    }

    async fn replay(
        &self,
        source_id: DispatchId,
        _actor: &str,
        _reason: &str,
        mode: ReplayMode,
    ) -> Result<ReplayOutcome, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(source) = inner.dispatches.get(&source_id).cloned() else {
            return Err(RepositoryError::NotFound(format!("dispatch {source_id}")));
        };
        let tag = mode.reason_tag();

        if let Some(existing) = inner.dispatches.values().find(|d| {
            d.replay_of == Some(source_id)
                && d.status.is_active()
                && d.control_reason.as_deref() == Some(tag)
        }) {
            return Ok(ReplayOutcome {
                dispatch: existing.clone(),
                already_queued: true,
            });
        }

        let now = Utc::now();
        let replay = RunDispatch {
            id: DispatchId::new(),
            run_key: source.run_key.clone(),
            queue_key: source.queue_key.clone(),
            work_item_id: source.work_item_id,
            agent_id: source.agent_id,
            session_key: source.session_key.clone(),
            job_id: None,
            status: DispatchStatus::Queued,
            control_state: ControlState::Normal,
            input_text: source.input_text.clone(),
            coalesced_text: source.coalesced_text.clone(),
            attempt_count: source.attempt_count,
            lease: None,
            claimed_epoch: None,
            replay_of: Some(source_id),
            control_reason: Some(tag.to_string()),
            last_error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        };
        inner.dispatches.insert(replay.id, replay.clone());

        if let Some(lane) = inner.lanes.get_mut(&source.queue_key) {
            // Make the lane eligible for the very next claim cycle, without
            // pre-empting a run already in flight.
            if lane.state != LaneState::Running {
                lane.state = LaneState::Queued;
            }
            lane.debounce_until = Some(now);
            lane.updated_at = now;
        }

        Ok(ReplayOutcome {
            dispatch: replay,
            already_queued: false,
        })
    }

    async fn find_by_id(&self, id: DispatchId) -> Result<Option<RunDispatch>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.dispatches.get(&id).cloned())
    }
}

#[async_trait]
impl EffectOutboxRepository for InMemoryDispatchStore {
    async fn enqueue(&self, effect: NewEffect) -> Result<EffectOutboxEntry, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = EffectOutboxEntry {
            id: EffectId::new(),
            work_item_id: effect.work_item_id,
            dispatch_id: effect.dispatch_id,
            payload: effect.payload,
            status: EffectStatus::Pending,
            retryable: true,
            next_attempt_at: None,
            attempt_count: 0,
            lease: None,
            claimed_epoch: None,
            provider_ref: None,
            last_error: None,
            unknown_reason: None,
            created_at: Utc::now(),
            sent_at: None,
        };
        inner.effects.push(entry.clone());
        Ok(entry)
    }

    async fn claim_next(
        &self,
        worker: &WorkerId,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<EffectOutboxEntry>, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let epoch = inner.epoch();
        let idx = {
            let mut claimable: Vec<usize> = inner
                .effects
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_claimable(now))
                .map(|(i, _)| i)
                .collect();
            claimable.sort_by_key(|&i| inner.effects[i].created_at);
            claimable.into_iter().next()
        };
        match idx {
            Some(i) => {
                let entry = &mut inner.effects[i];
                entry.status = EffectStatus::Sending;
                entry.attempt_count += 1;
                entry.lease = Some(Lease::acquire(worker.clone(), lease_ttl, now));
                entry.claimed_epoch = Some(epoch);
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }

    async fn mark_sent(
        &self,
        id: EffectId,
        provider_ref: &str,
        expected_epoch: Option<ControlEpoch>,
    ) -> Result<EffectMarkResult, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let observed = inner.epoch();
        if let Some(expected) = expected_epoch {
            if expected != observed {
                return Ok(EffectMarkResult::StaleEpoch { expected, observed });
            }
        }
        match inner.effects.iter_mut().find(|e| e.id == id) {
            Some(e) if e.status == EffectStatus::Sending => {
                e.status = EffectStatus::Sent;
                e.provider_ref = Some(provider_ref.to_string());
                e.sent_at = Some(Utc::now());
                e.lease = None;
                Ok(EffectMarkResult::Applied)
            }
            Some(_) => Ok(EffectMarkResult::LostRace),
            None => Err(RepositoryError::NotFound(format!("effect {id}"))),
        }
    }

    async fn mark_failed(
        &self,
        id: EffectId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        expected_epoch: Option<ControlEpoch>,
    ) -> Result<EffectMarkResult, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let observed = inner.epoch();
        if let Some(expected) = expected_epoch {
            if expected != observed {
                return Ok(EffectMarkResult::StaleEpoch { expected, observed });
            }
        }
        match inner.effects.iter_mut().find(|e| e.id == id) {
            Some(e) if e.status == EffectStatus::Sending => {
                e.status = EffectStatus::Failed;
                e.retryable = retry_at.is_some();
                e.next_attempt_at = retry_at;
                e.last_error = Some(error.to_string());
                e.lease = None;
                Ok(EffectMarkResult::Applied)
            }
            Some(_) => Ok(EffectMarkResult::LostRace),
            None => Err(RepositoryError::NotFound(format!("effect {id}"))),
        }
    }

    async fn mark_unknown(
        &self,
        id: EffectId,
        reason: &str,
        expected_epoch: Option<ControlEpoch>,
    ) -> Result<EffectMarkResult, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let observed = inner.epoch();
        if let Some(expected) = expected_epoch {
            if expected != observed {
                return Ok(EffectMarkResult::StaleEpoch { expected, observed });
            }
        }
        match inner.effects.iter_mut().find(|e| e.id == id) {
            Some(e) if e.status == EffectStatus::Sending => {
                e.status = EffectStatus::Unknown;
                e.unknown_reason = Some(reason.to_string());
                e.lease = None;
                Ok(EffectMarkResult::Applied)
            }
            Some(_) => Ok(EffectMarkResult::LostRace),
            None => Err(RepositoryError::NotFound(format!("effect {id}"))),
        }
    }

    async fn release_unknown(&self, id: EffectId) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.effects.iter_mut().find(|e| e.id == id) {
            Some(e) if e.status == EffectStatus::Unknown => {
                e.status = EffectStatus::Pending;
                e.retryable = true;
                e.next_attempt_at = None;
                e.lease = None;
                e.claimed_epoch = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, id: EffectId) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.effects.iter_mut().find(|e| e.id == id) {
            Some(e)
                if matches!(
                    e.status,
                    EffectStatus::Pending | EffectStatus::Failed | EffectStatus::Unknown
                ) =>
            {
                e.status = EffectStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_pending_by_dispatch(
        &self,
        dispatch_id: DispatchId,
    ) -> Result<u64, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let mut cancelled = 0;
        for e in inner.effects.iter_mut() {
            if e.dispatch_id == dispatch_id
                && matches!(e.status, EffectStatus::Pending | EffectStatus::Failed)
            {
                e.status = EffectStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn mark_stale_sending_unknown(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let mut moved = 0;
        for e in inner.effects.iter_mut() {
            if e.status == EffectStatus::Sending
                && e.lease.as_ref().map(|l| l.is_expired(now)).unwrap_or(true)
            {
                e.status = EffectStatus::Unknown;
                e.unknown_reason =
                    Some("lease expired while sending; outcome unknown".to_string());
                e.lease = None;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn find_by_id(
        &self,
        id: EffectId,
    ) -> Result<Option<EffectOutboxEntry>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.effects.iter().find(|e| e.id == id).cloned())
    }

    async fn find_by_dispatch(
        &self,
        dispatch_id: DispatchId,
    ) -> Result<Vec<EffectOutboxEntry>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .effects
            .iter()
            .filter(|e| e.dispatch_id == dispatch_id)
            .cloned()
            .collect())
    }
}

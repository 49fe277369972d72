// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Runtime Control Service
//!
//! Operator-facing control plane: global processing toggles, the fencing
//! epoch, per-lane pausing, per-job pause/resume/cancel, replays, and
//! manual resolution of `unknown` outbox entries.
//!
//! The emergency stop is the one place the epoch is bumped: it disables
//! admission AND voids every in-flight claim, so work finalized after the
//! stop is rejected at the epoch fence instead of landing silently.

use std::sync::Arc;

use metrics::counter;
use tracing::{info, warn};

use crate::domain::control::{PauseMode, RuntimeControl};
use crate::domain::dispatch::{DispatchId, JobId, ReplayMode};
use crate::domain::events::DispatchEvent;
use crate::domain::lane::QueueKey;
use crate::domain::outbox::EffectId;
use crate::domain::repository::{
    EffectOutboxRepository, QueueLaneRepository, ReplayOutcome, RepositoryError,
    RunDispatchRepository, RuntimeControlRepository,
};
use crate::infrastructure::event_bus::EventBus;

pub struct RuntimeControlService {
    control: Arc<dyn RuntimeControlRepository>,
    lanes: Arc<dyn QueueLaneRepository>,
    dispatches: Arc<dyn RunDispatchRepository>,
    outbox: Arc<dyn EffectOutboxRepository>,
    events: EventBus,
}

impl RuntimeControlService {
    pub fn new(
        control: Arc<dyn RuntimeControlRepository>,
        lanes: Arc<dyn QueueLaneRepository>,
        dispatches: Arc<dyn RunDispatchRepository>,
        outbox: Arc<dyn EffectOutboxRepository>,
        events: EventBus,
    ) -> Self {
        Self {
            control,
            lanes,
            dispatches,
            outbox,
            events,
        }
    }

    pub async fn status(&self) -> Result<RuntimeControl, RepositoryError> {
        self.control.get_or_init().await
    }

    /// Emergency stop: disable admission and bump the fencing epoch in the
    /// same operation. Already-claimed dispatches keep running but their
    /// finalize (and their effects' marks) will be rejected as stale.
    pub async fn emergency_stop(&self, actor: &str) -> Result<RuntimeControl, RepositoryError> {
        let state = self
            .control
            .set_processing_enabled(false, PauseMode::Hard)
            .await?;
        let epoch = self.control.bump_epoch().await?;
        warn!(actor, epoch = %epoch, "emergency stop: processing disabled, epoch bumped");
        counter!("aegis_control_emergency_stops_total").increment(1);
        Ok(RuntimeControl {
            control_epoch: epoch,
            ..state
        })
    }

    /// Soft pause: stop admitting new dispatches but let in-flight work
    /// finish and land normally. No epoch bump.
    pub async fn pause_processing(&self, actor: &str) -> Result<RuntimeControl, RepositoryError> {
        let state = self
            .control
            .set_processing_enabled(false, PauseMode::Soft)
            .await?;
        info!(actor, "processing paused (soft)");
        Ok(state)
    }

    pub async fn resume_processing(&self, actor: &str) -> Result<RuntimeControl, RepositoryError> {
        let state = self
            .control
            .set_processing_enabled(true, PauseMode::Soft)
            .await?;
        info!(actor, "processing resumed");
        Ok(state)
    }

    pub async fn set_max_concurrent(
        &self,
        limit: i32,
        actor: &str,
    ) -> Result<RuntimeControl, RepositoryError> {
        let state = self.control.set_max_concurrent_dispatches(limit).await?;
        info!(actor, limit, "max concurrent dispatches updated");
        Ok(state)
    }

    pub async fn pause_lane(&self, key: &QueueKey, actor: &str) -> Result<bool, RepositoryError> {
        let applied = self.lanes.pause_lane(key).await?;
        if applied {
            info!(actor, queue_key = %key, "lane paused");
        }
        Ok(applied)
    }

    pub async fn resume_lane(&self, key: &QueueKey, actor: &str) -> Result<bool, RepositoryError> {
        let applied = self.lanes.resume_lane(key).await?;
        if applied {
            info!(actor, queue_key = %key, "lane resumed");
        }
        Ok(applied)
    }

    /// Request a cooperative pause of the dispatch bound to this job. The
    /// worker observes the request on its next supervision tick.
    pub async fn pause_job(&self, job_id: &JobId, actor: &str) -> Result<bool, RepositoryError> {
        let applied = self.dispatches.request_pause_by_job(job_id).await?;
        if applied {
            info!(actor, job = %job_id, "pause requested");
        }
        Ok(applied)
    }

    /// Resume a paused dispatch: flips it back to a claimable queued state
    /// so any worker can pick it up where it left off.
    pub async fn resume_job(&self, job_id: &JobId, actor: &str) -> Result<bool, RepositoryError> {
        let applied = self.dispatches.resume_by_job(job_id).await?;
        if applied {
            info!(actor, job = %job_id, "dispatch resumed");
        }
        Ok(applied)
    }

    pub async fn cancel_job(&self, job_id: &JobId, actor: &str) -> Result<bool, RepositoryError> {
        let applied = self.dispatches.request_cancel_by_job(job_id).await?;
        if applied {
            info!(actor, job = %job_id, "cancel requested");
        }
        Ok(applied)
    }

    /// Re-materialize a finished or abandoned dispatch as a fresh queued
    /// one. Idempotent per (source, reason tag): repeating the request
    /// while the replay is still active returns it instead of duplicating.
    pub async fn replay_dispatch(
        &self,
        source_id: DispatchId,
        mode: ReplayMode,
        actor: &str,
        reason: &str,
    ) -> Result<ReplayOutcome, RepositoryError> {
        let outcome = self.dispatches.replay(source_id, actor, reason, mode).await?;
        if outcome.already_queued {
            info!(
                actor,
                source = %source_id,
                replay = %outcome.dispatch.id,
                "replay already queued, returning existing"
            );
        } else {
            info!(
                actor,
                source = %source_id,
                replay = %outcome.dispatch.id,
                reason,
                "dispatch replayed"
            );
            counter!("aegis_dispatch_replays_total").increment(1);
        }
        self.events.publish_dispatch_event(DispatchEvent::Replayed {
            source_id,
            replay_id: outcome.dispatch.id,
            already_queued: outcome.already_queued,
        });
        Ok(outcome)
    }

    /// Operator verdict on an ambiguous effect: it did NOT reach the
    /// provider, so release it back to pending for redelivery.
    pub async fn release_unknown_effect(
        &self,
        id: EffectId,
        actor: &str,
    ) -> Result<bool, RepositoryError> {
        let applied = self.outbox.release_unknown(id).await?;
        if applied {
            info!(actor, effect = %id, "unknown effect released for redelivery");
            counter!("aegis_effect_unknown_released_total").increment(1);
        }
        Ok(applied)
    }

    /// Operator verdict on an ambiguous effect: it DID reach the provider
    /// (or is no longer wanted), so cancel it.
    pub async fn cancel_effect(&self, id: EffectId, actor: &str) -> Result<bool, RepositoryError> {
        let applied = self.outbox.cancel(id).await?;
        if applied {
            info!(actor, effect = %id, "effect cancelled");
        }
        Ok(applied)
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! The dispatch worker loop.
//!
//! Each worker is an independent process/task with no shared in-memory
//! state; all coordination goes through the repository operations. The loop
//! is: claim → execute through the `AgentExecutor` seam → supervise
//! (heartbeat the lease, poll the control directive) → finalize with the
//! claimed epoch.
//!
//! Cancellation is cooperative only. Pause/cancel directives cancel a
//! `CancellationToken` that the executor must observe at its own safe
//! points; a long-running external call inside a claimed dispatch is not
//! interruptible mid-flight.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::config::DispatchConfig;
use crate::domain::dispatch::{
    ControlDirective, DispatchOutcome, JobId, RunDispatch, SteerMessage,
};
use crate::domain::events::DispatchEvent;
use crate::domain::lane::QueueMessage;
use crate::domain::lease::WorkerId;
use crate::domain::outbox::{EffectPayload, NewEffect};
use crate::domain::repository::{
    ClaimedDispatch, EffectOutboxRepository, FinalizeResult, RunDispatchRepository,
};
use crate::infrastructure::event_bus::EventBus;

/// Everything an executor gets for one turn of agent work.
pub struct TurnContext {
    pub dispatch: RunDispatch,
    pub messages: Vec<QueueMessage>,
    /// Cancelled when a pause or cancel directive arrives, or when the
    /// lease is lost. The executor must return promptly once this fires.
    pub cancel: CancellationToken,
    /// Steered messages arriving mid-run (steer-mode lanes only). The
    /// worker has already consumed them; the executor only weaves them in.
    pub steered: mpsc::UnboundedReceiver<Vec<SteerMessage>>,
    /// Report the job the run produced, once, as soon as it exists; the
    /// worker binds it so operators can pause/cancel by job.
    pub job: mpsc::UnboundedSender<JobId>,
}

/// What a completed turn produced.
pub struct TurnOutput {
    /// External side effects to queue through the outbox. Durably recorded
    /// before finalize, delivered separately.
    pub effects: Vec<EffectPayload>,
}

/// The seam to actual agent inference, which is out of scope here.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, turn: TurnContext) -> Result<TurnOutput>;
}

/// How supervision resolved while the executor ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    Normal,
    PauseRequested,
    CancelRequested,
    LeaseLost,
}

pub struct DispatchWorker {
    worker_id: WorkerId,
    dispatches: Arc<dyn RunDispatchRepository>,
    outbox: Arc<dyn EffectOutboxRepository>,
    executor: Arc<dyn AgentExecutor>,
    events: EventBus,
    config: DispatchConfig,
}

impl DispatchWorker {
    pub fn new(
        worker_id: WorkerId,
        dispatches: Arc<dyn RunDispatchRepository>,
        outbox: Arc<dyn EffectOutboxRepository>,
        executor: Arc<dyn AgentExecutor>,
        events: EventBus,
        config: DispatchConfig,
    ) -> Self {
        Self {
            worker_id,
            dispatches,
            outbox,
            executor,
            events,
            config,
        }
    }

    /// Poll-claim-execute until `shutdown` fires. Leaves any in-flight
    /// dispatch to finish its current turn first.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(worker = %self.worker_id, "dispatch worker started");
        loop {
            if shutdown.is_cancelled() {
                info!(worker = %self.worker_id, "dispatch worker stopping");
                return Ok(());
            }
            match self.run_once().await? {
                true => continue,
                false => {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                    }
                }
            }
        }
    }

    /// One claim attempt. Returns whether a dispatch was claimed and run.
    pub async fn run_once(&self) -> Result<bool> {
        let claimed = self
            .dispatches
            .claim_next(
                &self.worker_id,
                self.config.dispatch_lease_ttl_chrono(),
                Utc::now(),
            )
            .await?;
        let Some(claimed) = claimed else {
            return Ok(false);
        };

        counter!("aegis_dispatch_claims_total").increment(1);
        self.events.publish_dispatch_event(DispatchEvent::Claimed {
            dispatch_id: claimed.dispatch.id,
            queue_key: claimed.dispatch.queue_key.clone(),
            message_count: claimed.messages.len(),
            attempt: claimed.dispatch.attempt_count,
        });

        self.run_claimed(claimed).await?;
        Ok(true)
    }

    async fn run_claimed(&self, claimed: ClaimedDispatch) -> Result<()> {
        let dispatch = claimed.dispatch;
        let dispatch_id = dispatch.id;
        let queue_key = dispatch.queue_key.clone();
        let expected_epoch = dispatch.claimed_epoch;

        let cancel = CancellationToken::new();
        let (steer_tx, steer_rx) = mpsc::unbounded_channel();
        let (job_tx, mut job_rx) = mpsc::unbounded_channel();

        let turn = TurnContext {
            dispatch: dispatch.clone(),
            messages: claimed.messages,
            cancel: cancel.clone(),
            steered: steer_rx,
            job: job_tx,
        };

        let exec_fut = self.executor.execute(turn);
        tokio::pin!(exec_fut);
        let mut ticks = tokio::time::interval(self.config.supervision_interval);
        // The first tick fires immediately; skip it so the executor gets a
        // full interval before the first directive poll.
        ticks.tick().await;

        let mut fate = Fate::Normal;
        let result = loop {
            tokio::select! {
                result = &mut exec_fut => break result,
                Some(job_id) = job_rx.recv() => {
                    if !self.dispatches.bind_job(dispatch_id, job_id.clone()).await? {
                        debug!(dispatch = %dispatch_id, job = %job_id.as_str(), "job already bound");
                    }
                }
                _ = ticks.tick() => {
                    if fate != Fate::Normal {
                        // Already winding down; just wait for the executor.
                        continue;
                    }
                    if !self
                        .dispatches
                        .heartbeat(
                            dispatch_id,
                            &self.worker_id,
                            self.config.dispatch_lease_ttl_chrono(),
                            Utc::now(),
                        )
                        .await?
                    {
                        warn!(dispatch = %dispatch_id, "lease lost; abandoning run");
                        counter!("aegis_dispatch_lease_lost_total").increment(1);
                        fate = Fate::LeaseLost;
                        cancel.cancel();
                        continue;
                    }
                    match self.dispatches.control_directive(dispatch_id).await? {
                        ControlDirective::Continue => {}
                        ControlDirective::Steer { messages } => {
                            // Consumption and turn-injection are separate
                            // steps: hand the snapshots over first, then
                            // mark exactly those ids included.
                            let ids: Vec<_> = messages.iter().map(|m| m.id).collect();
                            let _ = steer_tx.send(messages);
                            let consumed =
                                self.dispatches.consume_steered(dispatch_id, &ids).await?;
                            debug!(dispatch = %dispatch_id, consumed, "steered messages consumed");
                        }
                        ControlDirective::Pause => {
                            info!(dispatch = %dispatch_id, "pause directive observed");
                            fate = Fate::PauseRequested;
                            cancel.cancel();
                        }
                        ControlDirective::Cancel => {
                            info!(dispatch = %dispatch_id, "cancel directive observed");
                            fate = Fate::CancelRequested;
                            cancel.cancel();
                        }
                    }
                }
            }
        };

        match fate {
            Fate::LeaseLost => {
                // The reaper (or another claimant) owns this dispatch now;
                // finalizing would race it. Discard queued side effects.
                self.outbox.cancel_pending_by_dispatch(dispatch_id).await?;
                Ok(())
            }
            Fate::PauseRequested => {
                if !self.dispatches.confirm_pause(dispatch_id).await? {
                    debug!(dispatch = %dispatch_id, "pause no longer applicable");
                }
                Ok(())
            }
            Fate::CancelRequested => {
                self.finalize(
                    dispatch_id,
                    DispatchOutcome::Cancelled { reason: None },
                    expected_epoch,
                    &queue_key,
                )
                .await
            }
            Fate::Normal => match result {
                Ok(output) => {
                    for payload in output.effects {
                        self.outbox
                            .enqueue(NewEffect {
                                work_item_id: dispatch.work_item_id,
                                dispatch_id,
                                payload,
                            })
                            .await?;
                    }
                    self.finalize(
                        dispatch_id,
                        DispatchOutcome::Completed,
                        expected_epoch,
                        &queue_key,
                    )
                    .await
                }
                Err(error) => {
                    self.finalize(
                        dispatch_id,
                        DispatchOutcome::Failed {
                            error: error.to_string(),
                        },
                        expected_epoch,
                        &queue_key,
                    )
                    .await
                }
            },
        }
    }

    async fn finalize(
        &self,
        dispatch_id: crate::domain::dispatch::DispatchId,
        outcome: DispatchOutcome,
        expected_epoch: Option<crate::domain::control::ControlEpoch>,
        queue_key: &crate::domain::lane::QueueKey,
    ) -> Result<()> {
        let status = outcome.status();
        match self
            .dispatches
            .finalize(dispatch_id, outcome, expected_epoch)
            .await?
        {
            FinalizeResult::Applied => {
                counter!("aegis_dispatch_finalized_total").increment(1);
                self.events.publish_dispatch_event(DispatchEvent::Finalized {
                    dispatch_id,
                    queue_key: queue_key.clone(),
                    status,
                });
                Ok(())
            }
            FinalizeResult::StaleEpoch { expected, observed } => {
                // A global control action disowned this generation of work.
                // Queued side effects must be discarded, not delivered.
                warn!(
                    dispatch = %dispatch_id,
                    expected = %expected,
                    observed = %observed,
                    "finalize rejected by stale epoch; discarding queued effects"
                );
                counter!("aegis_dispatch_stale_epoch_total").increment(1);
                self.events
                    .publish_dispatch_event(DispatchEvent::StaleEpochRejected {
                        dispatch_id,
                        expected,
                        observed,
                    });
                self.outbox.cancel_pending_by_dispatch(dispatch_id).await?;
                Ok(())
            }
            FinalizeResult::LostRace => {
                warn!(dispatch = %dispatch_id, "finalize lost race; dispatch already settled");
                Ok(())
            }
        }
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service-layer tests: the dispatch worker loop, the effect delivery
//! loop, the lease reaper and the runtime control service, wired over the
//! in-memory store with stub executor/sender seams.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{Duration, Utc};

use aegis_dispatch_core::application::{
    AgentExecutor, DeliveryOutcome, DispatchWorker, EffectDeliveryService, EffectSender,
    LeaseReaper, RuntimeControlService, TurnContext, TurnOutput,
};
use aegis_dispatch_core::domain::config::DispatchConfig;
use aegis_dispatch_core::domain::dispatch::{DispatchStatus, JobId, ReplayMode};
use aegis_dispatch_core::domain::lane::{
    AgentId, LaneMode, NewQueueMessage, QueueKey, SessionKey, WorkItemId,
};
use aegis_dispatch_core::domain::lease::WorkerId;
use aegis_dispatch_core::domain::outbox::{
    EffectOutboxEntry, EffectPayload, EffectStatus, NewEffect,
};
use aegis_dispatch_core::domain::repository::{
    EffectOutboxRepository, QueueLaneRepository, RunDispatchRepository,
    RuntimeControlRepository,
};
use aegis_dispatch_core::infrastructure::repositories::InMemoryDispatchStore;
use aegis_dispatch_core::infrastructure::EventBus;

fn fast_config() -> DispatchConfig {
    DispatchConfig {
        supervision_interval: StdDuration::from_millis(20),
        idle_poll_interval: StdDuration::from_millis(20),
        ..DispatchConfig::default()
    }
}

fn inbound(key: &str, text: &str) -> NewQueueMessage {
    NewQueueMessage {
        queue_key: QueueKey::new(key),
        session_key: SessionKey::new("session-1"),
        agent_id: AgentId::new(),
        plugin_instance_id: None,
        work_item_id: WorkItemId::new(),
        text: text.to_string(),
        sender_name: "alice".to_string(),
        arrived_at: Utc::now() - Duration::seconds(10),
        mode: LaneMode::Collect,
        debounce_ms: 1000,
        max_queued: 5,
    }
}

fn worker_with(
    store: &InMemoryDispatchStore,
    executor: Arc<dyn AgentExecutor>,
    events: EventBus,
) -> DispatchWorker {
    DispatchWorker::new(
        WorkerId::new("w1"),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        executor,
        events,
        fast_config(),
    )
}

/// Replies with one chat effect built from the turn input.
struct ReplyExecutor;

#[async_trait]
impl AgentExecutor for ReplyExecutor {
    async fn execute(&self, turn: TurnContext) -> anyhow::Result<TurnOutput> {
        Ok(TurnOutput {
            effects: vec![EffectPayload::ChatMessage {
                session_key: turn.dispatch.session_key.clone(),
                text: format!("re: {}", turn.dispatch.input_text),
            }],
        })
    }
}

struct FailingExecutor;

#[async_trait]
impl AgentExecutor for FailingExecutor {
    async fn execute(&self, _turn: TurnContext) -> anyhow::Result<TurnOutput> {
        Err(anyhow!("inference backend unavailable"))
    }
}

/// Reports a job id, then blocks until the worker cancels the turn.
struct CancelAwareExecutor;

#[async_trait]
impl AgentExecutor for CancelAwareExecutor {
    async fn execute(&self, turn: TurnContext) -> anyhow::Result<TurnOutput> {
        let _ = turn.job.send(JobId::new("job-1"));
        turn.cancel.cancelled().await;
        Ok(TurnOutput { effects: vec![] })
    }
}

/// Bumps the control epoch mid-run, simulating an emergency stop racing
/// the turn, then emits an effect that must be discarded.
struct EpochBumpingExecutor {
    control: Arc<dyn RuntimeControlRepository>,
}

#[async_trait]
impl AgentExecutor for EpochBumpingExecutor {
    async fn execute(&self, turn: TurnContext) -> anyhow::Result<TurnOutput> {
        self.control.bump_epoch().await?;
        Ok(TurnOutput {
            effects: vec![EffectPayload::ChatMessage {
                session_key: turn.dispatch.session_key.clone(),
                text: "this must never be delivered".to_string(),
            }],
        })
    }
}

struct StaticSender(DeliveryOutcome);

#[async_trait]
impl EffectSender for StaticSender {
    async fn deliver(&self, _entry: &EffectOutboxEntry) -> DeliveryOutcome {
        self.0.clone()
    }
}

fn delivery_with(store: &InMemoryDispatchStore, sender: Arc<dyn EffectSender>) -> EffectDeliveryService {
    EffectDeliveryService::new(
        WorkerId::new("d1"),
        Arc::new(store.clone()),
        sender,
        EventBus::with_default_capacity(),
        fast_config(),
    )
}

#[tokio::test]
async fn worker_completes_a_turn_and_queues_its_effects() {
    let store = InMemoryDispatchStore::new();
    let lanes: Arc<dyn QueueLaneRepository> = Arc::new(store.clone());
    let dispatches: Arc<dyn RunDispatchRepository> = Arc::new(store.clone());
    let outbox: Arc<dyn EffectOutboxRepository> = Arc::new(store.clone());
    let worker = worker_with(&store, Arc::new(ReplyExecutor), EventBus::with_default_capacity());

    lanes.enqueue_message(inbound("k", "hello")).await.unwrap();
    assert!(worker.run_once().await.unwrap());
    // Nothing left to claim.
    assert!(!worker.run_once().await.unwrap());

    let lane = lanes.find_lane(&QueueKey::new("k")).await.unwrap().unwrap();
    let pending = lanes.pending_messages(&QueueKey::new("k")).await.unwrap();
    assert!(pending.is_empty());
    assert!(lane.active_dispatch_id.is_none());

    // The dispatch completed and its effect sits pending in the outbox.
    let entry = outbox
        .claim_next(&WorkerId::new("probe"), Duration::seconds(60), Utc::now())
        .await
        .unwrap()
        .unwrap();
    match &entry.payload {
        EffectPayload::ChatMessage { text, .. } => assert_eq!(text, "re: hello"),
        other => panic!("unexpected payload: {other:?}"),
    }
    let dispatch = dispatches.find_by_id(entry.dispatch_id).await.unwrap().unwrap();
    assert_eq!(dispatch.status, DispatchStatus::Completed);
    assert!(dispatch.finished_at.is_some());
}

#[tokio::test]
async fn worker_records_executor_failure() {
    let store = InMemoryDispatchStore::new();
    let lanes: Arc<dyn QueueLaneRepository> = Arc::new(store.clone());
    let dispatches: Arc<dyn RunDispatchRepository> = Arc::new(store.clone());
    let events = EventBus::with_default_capacity();
    let worker = worker_with(&store, Arc::new(FailingExecutor), events.clone());

    lanes.enqueue_message(inbound("k", "doomed")).await.unwrap();
    let mut rx = events.subscribe();
    assert!(worker.run_once().await.unwrap());

    // Claimed then Finalized(failed) on the bus.
    use aegis_dispatch_core::domain::events::DispatchEvent;
    use aegis_dispatch_core::infrastructure::CoreEvent;
    let claimed_id = match rx.recv().await.unwrap() {
        CoreEvent::Dispatch(DispatchEvent::Claimed { dispatch_id, .. }) => dispatch_id,
        other => panic!("unexpected event: {other:?}"),
    };
    match rx.recv().await.unwrap() {
        CoreEvent::Dispatch(DispatchEvent::Finalized { dispatch_id, status, .. }) => {
            assert_eq!(dispatch_id, claimed_id);
            assert_eq!(status, DispatchStatus::Failed);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let dispatch = dispatches.find_by_id(claimed_id).await.unwrap().unwrap();
    assert_eq!(dispatch.status, DispatchStatus::Failed);
    assert!(dispatch
        .last_error
        .unwrap()
        .contains("inference backend unavailable"));
}

#[tokio::test]
async fn worker_discards_effects_when_finalize_hits_a_stale_epoch() {
    let store = InMemoryDispatchStore::new();
    let lanes: Arc<dyn QueueLaneRepository> = Arc::new(store.clone());
    let dispatches: Arc<dyn RunDispatchRepository> = Arc::new(store.clone());
    let outbox: Arc<dyn EffectOutboxRepository> = Arc::new(store.clone());
    let executor = Arc::new(EpochBumpingExecutor {
        control: Arc::new(store.clone()),
    });
    let worker = worker_with(&store, executor, EventBus::with_default_capacity());

    lanes.enqueue_message(inbound("k", "racing a stop")).await.unwrap();
    assert!(worker.run_once().await.unwrap());

    // Finalize was fenced: the dispatch never completed and its queued
    // effect was cancelled, not left deliverable.
    let lane = lanes.find_lane(&QueueKey::new("k")).await.unwrap().unwrap();
    let dispatch = dispatches
        .find_by_id(lane.active_dispatch_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dispatch.status, DispatchStatus::Running);

    let effects = outbox.find_by_dispatch(dispatch.id).await.unwrap();
    assert_eq!(effects.len(), 1);
    assert_eq!(effects[0].status, EffectStatus::Cancelled);
    assert!(outbox
        .claim_next(&WorkerId::new("probe"), Duration::seconds(60), Utc::now())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn worker_observes_pause_directive_and_confirms() {
    let store = InMemoryDispatchStore::new();
    let lanes: Arc<dyn QueueLaneRepository> = Arc::new(store.clone());
    let dispatches: Arc<dyn RunDispatchRepository> = Arc::new(store.clone());
    let worker = Arc::new(worker_with(
        &store,
        Arc::new(CancelAwareExecutor),
        EventBus::with_default_capacity(),
    ));

    lanes.enqueue_message(inbound("k", "long haul")).await.unwrap();

    let running = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run_once().await })
    };

    // Wait for the worker to bind the job, then request a pause.
    let job = JobId::new("job-1");
    let mut bound = false;
    for _ in 0..100 {
        if dispatches.request_pause_by_job(&job).await.unwrap() {
            bound = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(bound, "job was never bound");

    assert!(running.await.unwrap().unwrap());

    let lane = lanes.find_lane(&QueueKey::new("k")).await.unwrap().unwrap();
    let dispatch = dispatches
        .find_by_id(lane.active_dispatch_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dispatch.status, DispatchStatus::Paused);
    assert!(dispatch.lease.is_none());

    // Resume requeues it; the idle worker loop adopts it on its next claim.
    assert!(dispatches.resume_by_job(&job).await.unwrap());
    let dispatch = dispatches.find_by_id(dispatch.id).await.unwrap().unwrap();
    assert_eq!(dispatch.status, DispatchStatus::Queued);
}

#[tokio::test]
async fn worker_cancels_cooperatively() {
    let store = InMemoryDispatchStore::new();
    let lanes: Arc<dyn QueueLaneRepository> = Arc::new(store.clone());
    let dispatches: Arc<dyn RunDispatchRepository> = Arc::new(store.clone());
    let events = EventBus::with_default_capacity();
    let worker = Arc::new(worker_with(&store, Arc::new(CancelAwareExecutor), events.clone()));

    lanes.enqueue_message(inbound("k", "abort me")).await.unwrap();
    let mut rx = events.subscribe();

    let running = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run_once().await })
    };

    let job = JobId::new("job-1");
    let mut requested = false;
    for _ in 0..100 {
        if dispatches.request_cancel_by_job(&job).await.unwrap() {
            requested = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(requested, "job was never bound");

    assert!(running.await.unwrap().unwrap());

    use aegis_dispatch_core::domain::events::DispatchEvent;
    use aegis_dispatch_core::infrastructure::CoreEvent;
    let claimed_id = match rx.recv().await.unwrap() {
        CoreEvent::Dispatch(DispatchEvent::Claimed { dispatch_id, .. }) => dispatch_id,
        other => panic!("unexpected event: {other:?}"),
    };
    match rx.recv().await.unwrap() {
        CoreEvent::Dispatch(DispatchEvent::Finalized { status, .. }) => {
            assert_eq!(status, DispatchStatus::Cancelled);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    let dispatch = dispatches.find_by_id(claimed_id).await.unwrap().unwrap();
    assert_eq!(dispatch.status, DispatchStatus::Cancelled);

    let lane = lanes.find_lane(&QueueKey::new("k")).await.unwrap().unwrap();
    assert!(lane.active_dispatch_id.is_none());
}

#[tokio::test]
async fn delivery_marks_sent_on_confirmed_outcome() {
    let store = InMemoryDispatchStore::new();
    let outbox: Arc<dyn EffectOutboxRepository> = Arc::new(store.clone());
    let service = delivery_with(
        &store,
        Arc::new(StaticSender(DeliveryOutcome::Sent {
            provider_ref: "provider-1".to_string(),
        })),
    );

    let entry = outbox
        .enqueue(NewEffect {
            work_item_id: WorkItemId::new(),
            dispatch_id: aegis_dispatch_core::domain::dispatch::DispatchId::new(),
            payload: EffectPayload::ChatMessage {
                session_key: SessionKey::new("s"),
                text: "out".to_string(),
            },
        })
        .await
        .unwrap();

    assert!(service.run_once().await.unwrap());
    assert!(!service.run_once().await.unwrap());

    let entry = outbox.find_by_id(entry.id).await.unwrap().unwrap();
    assert_eq!(entry.status, EffectStatus::Sent);
    assert_eq!(entry.provider_ref.as_deref(), Some("provider-1"));
}

#[tokio::test]
async fn delivery_schedules_retry_on_retryable_failure() {
    let store = InMemoryDispatchStore::new();
    let outbox: Arc<dyn EffectOutboxRepository> = Arc::new(store.clone());
    let service = delivery_with(
        &store,
        Arc::new(StaticSender(DeliveryOutcome::Failed {
            error: "502 from provider".to_string(),
            retryable: true,
        })),
    );

    let entry = outbox
        .enqueue(NewEffect {
            work_item_id: WorkItemId::new(),
            dispatch_id: aegis_dispatch_core::domain::dispatch::DispatchId::new(),
            payload: EffectPayload::ChatMessage {
                session_key: SessionKey::new("s"),
                text: "flaky".to_string(),
            },
        })
        .await
        .unwrap();

    assert!(service.run_once().await.unwrap());

    let entry = outbox.find_by_id(entry.id).await.unwrap().unwrap();
    assert_eq!(entry.status, EffectStatus::Failed);
    assert!(entry.retryable);
    let next = entry.next_attempt_at.unwrap();
    assert!(next > Utc::now());
    // First attempt: backoff equals the configured base.
    assert!(next <= Utc::now() + Duration::seconds(6));
}

#[tokio::test]
async fn delivery_parks_unknown_outcomes() {
    let store = InMemoryDispatchStore::new();
    let outbox: Arc<dyn EffectOutboxRepository> = Arc::new(store.clone());
    let service = delivery_with(
        &store,
        Arc::new(StaticSender(DeliveryOutcome::Unknown {
            reason: "request timed out after send".to_string(),
        })),
    );

    let entry = outbox
        .enqueue(NewEffect {
            work_item_id: WorkItemId::new(),
            dispatch_id: aegis_dispatch_core::domain::dispatch::DispatchId::new(),
            payload: EffectPayload::ChatMessage {
                session_key: SessionKey::new("s"),
                text: "ambiguous".to_string(),
            },
        })
        .await
        .unwrap();

    assert!(service.run_once().await.unwrap());
    // Parked: the next cycle finds nothing.
    assert!(!service.run_once().await.unwrap());

    let entry = outbox.find_by_id(entry.id).await.unwrap().unwrap();
    assert_eq!(entry.status, EffectStatus::Unknown);
    assert_eq!(
        entry.unknown_reason.as_deref(),
        Some("request timed out after send")
    );
}

#[tokio::test]
async fn reaper_sweep_abandons_expired_leases_and_parks_stale_sends() {
    let store = InMemoryDispatchStore::new();
    let lanes: Arc<dyn QueueLaneRepository> = Arc::new(store.clone());
    let dispatches: Arc<dyn RunDispatchRepository> = Arc::new(store.clone());
    let outbox: Arc<dyn EffectOutboxRepository> = Arc::new(store.clone());
    let events = EventBus::with_default_capacity();
    let reaper = LeaseReaper::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        events.clone(),
        fast_config(),
    );

    // A dispatch and a sending effect whose leases are already expired.
    lanes.enqueue_message(inbound("k", "orphaned")).await.unwrap();
    let claimed = dispatches
        .claim_next(&WorkerId::new("w1"), Duration::seconds(-1), Utc::now())
        .await
        .unwrap()
        .unwrap();
    outbox
        .enqueue(NewEffect {
            work_item_id: claimed.dispatch.work_item_id,
            dispatch_id: claimed.dispatch.id,
            payload: EffectPayload::ChatMessage {
                session_key: SessionKey::new("s"),
                text: "orphaned send".to_string(),
            },
        })
        .await
        .unwrap();
    let effect = outbox
        .claim_next(&WorkerId::new("d1"), Duration::seconds(-1), Utc::now())
        .await
        .unwrap()
        .unwrap();

    let mut rx = events.subscribe();
    reaper.sweep_once().await.unwrap();

    use aegis_dispatch_core::domain::events::DispatchEvent;
    use aegis_dispatch_core::infrastructure::CoreEvent;
    match rx.recv().await.unwrap() {
        CoreEvent::Dispatch(DispatchEvent::Reaped { dispatch_id, .. }) => {
            assert_eq!(dispatch_id, claimed.dispatch.id);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let dispatch = dispatches.find_by_id(claimed.dispatch.id).await.unwrap().unwrap();
    assert_eq!(dispatch.status, DispatchStatus::Abandoned);
    let effect = outbox.find_by_id(effect.id).await.unwrap().unwrap();
    assert_eq!(effect.status, EffectStatus::Unknown);
}

#[tokio::test]
async fn emergency_stop_disables_processing_and_bumps_the_epoch() {
    let store = InMemoryDispatchStore::new();
    let control_repo: Arc<dyn RuntimeControlRepository> = Arc::new(store.clone());
    let service = RuntimeControlService::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        EventBus::with_default_capacity(),
    );

    let before = control_repo.current_epoch().await.unwrap();
    let state = service.emergency_stop("operator").await.unwrap();
    assert!(!state.processing_enabled);
    assert_eq!(state.control_epoch, before.next());
    assert_eq!(control_repo.current_epoch().await.unwrap(), before.next());

    let resumed = service.resume_processing("operator").await.unwrap();
    assert!(resumed.processing_enabled);
    // Resume does not bump the epoch again.
    assert_eq!(control_repo.current_epoch().await.unwrap(), before.next());
}

#[tokio::test]
async fn control_service_pause_resume_cycle_by_job() {
    let store = InMemoryDispatchStore::new();
    let lanes: Arc<dyn QueueLaneRepository> = Arc::new(store.clone());
    let dispatches: Arc<dyn RunDispatchRepository> = Arc::new(store.clone());
    let service = RuntimeControlService::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        EventBus::with_default_capacity(),
    );

    lanes.enqueue_message(inbound("k", "hold on")).await.unwrap();
    let claimed = dispatches
        .claim_next(&WorkerId::new("w1"), Duration::seconds(120), Utc::now())
        .await
        .unwrap()
        .unwrap();
    let id = claimed.dispatch.id;
    let job = JobId::new("job-77");
    dispatches.bind_job(id, job.clone()).await.unwrap();

    assert!(service.pause_job(&job, "operator").await.unwrap());
    assert!(dispatches.confirm_pause(id).await.unwrap());
    assert!(service.resume_job(&job, "operator").await.unwrap());

    // The resumed dispatch goes back through the claim path.
    let reclaimed = dispatches
        .claim_next(&WorkerId::new("w2"), Duration::seconds(120), Utc::now())
        .await
        .unwrap()
        .expect("resumed dispatch is claimable");
    assert_eq!(reclaimed.dispatch.id, id);
    assert_eq!(reclaimed.dispatch.status, DispatchStatus::Running);
}

#[tokio::test]
async fn control_service_replay_publishes_and_dedupes() {
    let store = InMemoryDispatchStore::new();
    let lanes: Arc<dyn QueueLaneRepository> = Arc::new(store.clone());
    let dispatches: Arc<dyn RunDispatchRepository> = Arc::new(store.clone());
    let events = EventBus::with_default_capacity();
    let service = RuntimeControlService::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        events.clone(),
    );

    lanes.enqueue_message(inbound("k", "replay me")).await.unwrap();
    let claimed = dispatches
        .claim_next(&WorkerId::new("w1"), Duration::seconds(120), Utc::now())
        .await
        .unwrap()
        .unwrap();
    dispatches
        .finalize(
            claimed.dispatch.id,
            aegis_dispatch_core::domain::dispatch::DispatchOutcome::Failed {
                error: "boom".to_string(),
            },
            None,
        )
        .await
        .unwrap();

    let mut rx = events.subscribe();
    let first = service
        .replay_dispatch(claimed.dispatch.id, ReplayMode::Retry, "operator", "transient")
        .await
        .unwrap();
    assert!(!first.already_queued);
    let second = service
        .replay_dispatch(claimed.dispatch.id, ReplayMode::Retry, "operator", "again")
        .await
        .unwrap();
    assert!(second.already_queued);
    assert_eq!(second.dispatch.id, first.dispatch.id);

    use aegis_dispatch_core::domain::events::DispatchEvent;
    use aegis_dispatch_core::infrastructure::CoreEvent;
    for expected_dup in [false, true] {
        match rx.recv().await.unwrap() {
            CoreEvent::Dispatch(DispatchEvent::Replayed { already_queued, replay_id, .. }) => {
                assert_eq!(already_queued, expected_dup);
                assert_eq!(replay_id, first.dispatch.id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

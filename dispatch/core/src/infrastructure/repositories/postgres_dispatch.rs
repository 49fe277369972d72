// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! PostgreSQL implementation of the run-dispatch scheduler.
//!
//! Every claim-style operation here is the conditional-update idiom: a
//! transaction whose UPDATE carries the full expected prior state in its
//! WHERE clause, with `rows_affected` as the success signal. A lost race is
//! a sentinel return, never an error. Nothing below relies on
//! `SELECT .. FOR UPDATE`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::control::ControlEpoch;
use crate::domain::dispatch::{
    coalesce_digest, run_key, ControlDirective, ControlState, DispatchId, DispatchOutcome,
    DispatchStatus, JobId, ReplayMode, RunDispatch, SteerMessage,
};
use crate::domain::lane::{AgentId, LaneMode, MessageId, QueueKey, SessionKey, WorkItemId};
use crate::domain::lease::{Lease, WorkerId};
use crate::domain::repository::{
    ClaimedDispatch, FinalizeResult, ReapedDispatch, ReplayOutcome, RepositoryError,
    RunDispatchRepository,
};

use super::postgres_control::PostgresRuntimeControlRepository;
use super::postgres_lane::map_message_row;

const DISPATCH_COLUMNS: &str = r#"
    id, run_key, queue_key, work_item_id, agent_id, session_key, job_id,
    status, control_state, input_text, coalesced_text, attempt_count,
    claimed_by, lease_expires_at, claimed_epoch, replay_of_dispatch_id,
    control_reason, last_error, created_at, started_at, finished_at
"#;

pub struct PostgresRunDispatchRepository {
    pool: PgPool,
}

impl PostgresRunDispatchRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn map_dispatch_row(
    row: &sqlx::postgres::PgRow,
) -> Result<RunDispatch, RepositoryError> {
    let status: String = row.get("status");
    let control_state: String = row.get("control_state");
    let claimed_by: Option<String> = row.get("claimed_by");
    let lease_expires_at: Option<DateTime<Utc>> = row.get("lease_expires_at");
    let claimed_epoch: Option<i64> = row.get("claimed_epoch");
    let replay_of: Option<Uuid> = row.get("replay_of_dispatch_id");
    let job_id: Option<String> = row.get("job_id");

    Ok(RunDispatch {
        id: DispatchId(row.get("id")),
        run_key: row.get("run_key"),
        queue_key: QueueKey::new(row.get::<String, _>("queue_key")),
        work_item_id: WorkItemId(row.get("work_item_id")),
        agent_id: AgentId(row.get("agent_id")),
        session_key: SessionKey::new(row.get::<String, _>("session_key")),
        job_id: job_id.map(JobId::new),
        status: DispatchStatus::parse(&status).ok_or_else(|| {
            RepositoryError::Database(format!("unknown dispatch status: {status}"))
        })?,
        control_state: ControlState::parse(&control_state).ok_or_else(|| {
            RepositoryError::Database(format!("unknown control state: {control_state}"))
        })?,
        input_text: row.get("input_text"),
        coalesced_text: row.get("coalesced_text"),
        attempt_count: row.get("attempt_count"),
        lease: match (claimed_by, lease_expires_at) {
            (Some(holder), Some(expires_at)) => Some(Lease {
                holder: WorkerId::new(holder),
                expires_at,
            }),
            _ => None,
        },
        claimed_epoch: claimed_epoch.map(ControlEpoch),
        replay_of: replay_of.map(DispatchId),
        control_reason: row.get("control_reason"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

/// Recompute a lane after its active dispatch left the running/paused set:
/// Queued with a freshly armed debounce when work remains, Idle otherwise.
async fn settle_lane(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    queue_key: &str,
    now: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        UPDATE queue_lanes SET
            active_dispatch_id = NULL,
            state = CASE WHEN EXISTS (
                        SELECT 1 FROM queue_messages
                        WHERE queue_key = $1 AND status = 'pending'
                    ) OR EXISTS (
                        SELECT 1 FROM run_dispatches
                        WHERE queue_key = $1 AND status = 'queued'
                    )
                    THEN 'queued' ELSE 'idle' END,
            debounce_until = CASE WHEN EXISTS (
                        SELECT 1 FROM queue_messages
                        WHERE queue_key = $1 AND status = 'pending'
                    ) OR EXISTS (
                        SELECT 1 FROM run_dispatches
                        WHERE queue_key = $1 AND status = 'queued'
                    )
                    THEN $2 + make_interval(secs => CEIL(debounce_ms / 1000.0))
                    ELSE NULL END,
            updated_at = $2
        WHERE queue_key = $1
        "#,
    )
    .bind(queue_key)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl RunDispatchRepository for PostgresRunDispatchRepository {
    async fn claim_next(
        &self,
        worker: &WorkerId,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedDispatch>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let lease_expires_at = now + lease_ttl;

        // Global admission gate; the singleton row is created lazily so a
        // fresh deployment dispatches without an operator touch first.
        PostgresRuntimeControlRepository::ensure_row(&mut *tx).await?;
        let control = sqlx::query(
            "SELECT processing_enabled, control_epoch, max_concurrent_dispatches
             FROM runtime_control WHERE id = 1",
        )
        .fetch_one(&mut *tx)
        .await?;
        if !control.get::<bool, _>("processing_enabled") {
            return Ok(None);
        }
        let epoch: i64 = control.get("control_epoch");
        let max_concurrent: i32 = control.get("max_concurrent_dispatches");
        let running: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM run_dispatches WHERE status = 'running'")
                .fetch_one(&mut *tx)
                .await?
                .get("n");
        if running >= max_concurrent as i64 {
            return Ok(None);
        }

        // Phase 1: deterministic candidate selection, earliest ready first.
        let candidate = sqlx::query(
            r#"
            SELECT queue_key, session_key, agent_id, mode, max_queued
            FROM queue_lanes l
            WHERE state = 'queued'
              AND is_paused = FALSE
              AND (debounce_until IS NULL OR debounce_until <= $1)
              AND NOT EXISTS (
                  SELECT 1 FROM run_dispatches d
                  WHERE d.queue_key = l.queue_key AND d.status = 'running'
              )
            ORDER BY debounce_until ASC NULLS FIRST, queue_key ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let queue_key: String = candidate.get("queue_key");
        let session_key: String = candidate.get("session_key");
        let agent_id: Uuid = candidate.get("agent_id");
        let mode_str: String = candidate.get("mode");
        let mode = LaneMode::parse(&mode_str).ok_or_else(|| {
            RepositoryError::Database(format!("unknown lane mode: {mode_str}"))
        })?;
        let max_queued: i64 = candidate.get("max_queued");

        // CAS flip with the same predicate set as the selection. Zero rows
        // means another worker won the race; expected, not an error.
        let flipped = sqlx::query(
            r#"
            UPDATE queue_lanes l SET state = 'running', updated_at = $2
            WHERE queue_key = $1
              AND state = 'queued'
              AND is_paused = FALSE
              AND (debounce_until IS NULL OR debounce_until <= $2)
              AND NOT EXISTS (
                  SELECT 1 FROM run_dispatches d
                  WHERE d.queue_key = l.queue_key AND d.status = 'running'
              )
            "#,
        )
        .bind(&queue_key)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if flipped.rows_affected() == 0 {
            return Ok(None);
        }

        // Phase 2: messages (followup takes one, collect/steer take a batch).
        let take: i64 = match mode {
            LaneMode::Followup => 1,
            _ => max_queued.max(1),
        };
        let rows = sqlx::query(
            r#"
            SELECT id, queue_key, work_item_id, text, sender_name, arrived_at, status, dispatch_id
            FROM queue_messages
            WHERE queue_key = $1 AND status = 'pending'
            ORDER BY arrived_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(&queue_key)
        .bind(take)
        .fetch_all(&mut *tx)
        .await?;
        let messages = rows
            .iter()
            .map(map_message_row)
            .collect::<Result<Vec<_>, _>>()?;

        if messages.is_empty() {
            // A replay may have seeded a queued dispatch on this lane.
            let seeded = sqlx::query(&format!(
                r#"
                UPDATE run_dispatches SET
                    status = 'running',
                    attempt_count = attempt_count + 1,
                    claimed_by = $2,
                    lease_expires_at = $3,
                    claimed_epoch = $4,
                    started_at = $5
                WHERE id = (
                    SELECT id FROM run_dispatches
                    WHERE queue_key = $1 AND status = 'queued'
                    ORDER BY created_at ASC
                    LIMIT 1
                ) AND status = 'queued'
                RETURNING {DISPATCH_COLUMNS}
                "#
            ))
            .bind(&queue_key)
            .bind(worker.as_str())
            .bind(lease_expires_at)
            .bind(epoch)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            match seeded {
                Some(row) => {
                    let dispatch = map_dispatch_row(&row)?;
                    sqlx::query(
                        "UPDATE queue_lanes SET active_dispatch_id = $2, updated_at = $3
                         WHERE queue_key = $1",
                    )
                    .bind(&queue_key)
                    .bind(dispatch.id.0)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    return Ok(Some(ClaimedDispatch {
                        dispatch,
                        messages: Vec::new(),
                    }));
                }
                None => {
                    // Nothing to run after all; park the lane.
                    sqlx::query(
                        "UPDATE queue_lanes
                         SET state = 'idle', debounce_until = NULL, updated_at = $2
                         WHERE queue_key = $1 AND state = 'running'",
                    )
                    .bind(&queue_key)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    return Ok(None);
                }
            }
        }

        let last = messages.last().expect("messages is non-empty");
        let dispatch = RunDispatch {
            id: DispatchId::new(),
            run_key: run_key(&QueueKey::new(queue_key.clone()), last.id),
            queue_key: QueueKey::new(queue_key.clone()),
            work_item_id: last.work_item_id,
            agent_id: AgentId(agent_id),
            session_key: SessionKey::new(session_key),
            job_id: None,
            status: DispatchStatus::Running,
            control_state: ControlState::Normal,
            input_text: last.text.clone(),
            coalesced_text: if messages.len() > 1 && mode != LaneMode::Followup {
                Some(coalesce_digest(&messages))
            } else {
                None
            },
            attempt_count: 1,
            lease: Some(Lease {
                holder: worker.clone(),
                expires_at: lease_expires_at,
            }),
            claimed_epoch: Some(ControlEpoch(epoch)),
            replay_of: None,
            control_reason: None,
            last_error: None,
            created_at: now,
            started_at: Some(now),
            finished_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO run_dispatches (
                id, run_key, queue_key, work_item_id, agent_id, session_key, job_id,
                status, control_state, input_text, coalesced_text, attempt_count,
                claimed_by, lease_expires_at, claimed_epoch, replay_of_dispatch_id,
                control_reason, last_error, created_at, started_at, finished_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, NULL,
                'running', 'normal', $7, $8, 1,
                $9, $10, $11, NULL,
                NULL, NULL, $12, $12, NULL
            )
            "#,
        )
        .bind(dispatch.id.0)
        .bind(&dispatch.run_key)
        .bind(&queue_key)
        .bind(dispatch.work_item_id.0)
        .bind(agent_id)
        .bind(dispatch.session_key.as_str())
        .bind(&dispatch.input_text)
        .bind(&dispatch.coalesced_text)
        .bind(worker.as_str())
        .bind(lease_expires_at)
        .bind(epoch)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let message_ids: Vec<Uuid> = messages.iter().map(|m| m.id.0).collect();
        sqlx::query(
            r#"
            UPDATE queue_messages SET status = 'included', dispatch_id = $2
            WHERE id = ANY($1) AND status = 'pending'
            "#,
        )
        .bind(&message_ids)
        .bind(dispatch.id.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE queue_lanes SET active_dispatch_id = $2, updated_at = $3
             WHERE queue_key = $1",
        )
        .bind(&queue_key)
        .bind(dispatch.id.0)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(ClaimedDispatch { dispatch, messages }))
    }

    async fn heartbeat(
        &self,
        id: DispatchId,
        worker: &WorkerId,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE run_dispatches SET lease_expires_at = $3
            WHERE id = $1
              AND claimed_by = $2
              AND status IN ('running', 'paused')
            "#,
        )
        .bind(id.0)
        .bind(worker.as_str())
        .bind(now + lease_ttl)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn control_directive(
        &self,
        id: DispatchId,
    ) -> Result<ControlDirective, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT d.status, d.control_state, d.queue_key, l.mode
            FROM run_dispatches d
            JOIN queue_lanes l ON l.queue_key = d.queue_key
            WHERE d.id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("dispatch {id}")))?;

        let status_str: String = row.get("status");
        let status = DispatchStatus::parse(&status_str).ok_or_else(|| {
            RepositoryError::Database(format!("unknown dispatch status: {status_str}"))
        })?;
        let control_str: String = row.get("control_state");
        let control_state = ControlState::parse(&control_str).ok_or_else(|| {
            RepositoryError::Database(format!("unknown control state: {control_str}"))
        })?;
        let mode_str: String = row.get("mode");

        if status.is_terminal()
            || matches!(
                control_state,
                ControlState::CancelRequested | ControlState::Cancelled
            )
        {
            return Ok(ControlDirective::Cancel);
        }
        if status == DispatchStatus::Paused || control_state == ControlState::PauseRequested {
            return Ok(ControlDirective::Pause);
        }
        if LaneMode::parse(&mode_str) == Some(LaneMode::Steer) {
            let queue_key: String = row.get("queue_key");
            let rows = sqlx::query(
                r#"
                SELECT id, text, sender_name FROM queue_messages
                WHERE queue_key = $1 AND status = 'pending'
                ORDER BY arrived_at ASC, id ASC
                "#,
            )
            .bind(&queue_key)
            .fetch_all(&self.pool)
            .await?;
            if !rows.is_empty() {
                let messages = rows
                    .iter()
                    .map(|r| SteerMessage {
                        id: MessageId(r.get("id")),
                        text: r.get("text"),
                        sender_name: r.get("sender_name"),
                    })
                    .collect();
                return Ok(ControlDirective::Steer { messages });
            }
        }
        Ok(ControlDirective::Continue)
    }

    async fn consume_steered(
        &self,
        id: DispatchId,
        message_ids: &[MessageId],
    ) -> Result<usize, RepositoryError> {
        let ids: Vec<Uuid> = message_ids.iter().map(|m| m.0).collect();
        let result = sqlx::query(
            r#"
            UPDATE queue_messages m SET status = 'included', dispatch_id = $2
            WHERE m.id = ANY($1)
              AND m.status = 'pending'
              AND m.queue_key = (SELECT queue_key FROM run_dispatches WHERE id = $2)
            "#,
        )
        .bind(&ids)
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn bind_job(&self, id: DispatchId, job_id: JobId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE run_dispatches SET job_id = $2
            WHERE id = $1
              AND job_id IS NULL
              AND status IN ('queued', 'running', 'paused')
            "#,
        )
        .bind(id.0)
        .bind(job_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn request_pause_by_job(&self, job_id: &JobId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE run_dispatches SET control_state = 'pause_requested'
            WHERE job_id = $1
              AND status IN ('queued', 'running')
              AND control_state = 'normal'
            "#,
        )
        .bind(job_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn confirm_pause(&self, id: DispatchId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE run_dispatches SET
                status = 'paused',
                control_state = 'paused',
                claimed_by = NULL,
                lease_expires_at = NULL
            WHERE id = $1
              AND status = 'running'
              AND control_state = 'pause_requested'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn resume_by_job(&self, job_id: &JobId) -> Result<bool, RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        // No worker supervises a paused dispatch; resume parks it back to
        // queued so the next claim cycle adopts it as a seed.
        let row = sqlx::query(
            r#"
            UPDATE run_dispatches SET
                status = 'queued',
                control_state = 'normal',
                claimed_by = NULL,
                lease_expires_at = NULL
            WHERE job_id = $1 AND status = 'paused'
            RETURNING queue_key
            "#,
        )
        .bind(job_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let queue_key: String = row.get("queue_key");
        sqlx::query(
            r#"
            UPDATE queue_lanes SET
                state = 'queued',
                debounce_until = $2,
                active_dispatch_id = NULL,
                updated_at = $2
            WHERE queue_key = $1
            "#,
        )
        .bind(&queue_key)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn request_cancel_by_job(&self, job_id: &JobId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE run_dispatches SET control_state = 'cancel_requested'
            WHERE job_id = $1
              AND status IN ('queued', 'running', 'paused')
              AND control_state NOT IN ('cancel_requested', 'cancelled')
            "#,
        )
        .bind(job_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn finalize(
        &self,
        id: DispatchId,
        outcome: DispatchOutcome,
        expected_epoch: Option<ControlEpoch>,
    ) -> Result<FinalizeResult, RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let observed: i64 =
            sqlx::query("SELECT control_epoch FROM runtime_control WHERE id = 1")
                .fetch_optional(&mut *tx)
                .await?
                .map(|r| r.get("control_epoch"))
                .unwrap_or(0);
        let observed = ControlEpoch(observed);

        let row = sqlx::query(
            "SELECT queue_key, claimed_epoch FROM run_dispatches WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("dispatch {id}")))?;
        let queue_key: String = row.get("queue_key");
        let claimed_epoch: Option<i64> = row.get("claimed_epoch");
        let expected = expected_epoch.or(claimed_epoch.map(ControlEpoch));

        if let Some(expected) = expected {
            if expected != observed {
                // A global control action invalidated this generation of
                // work. Nothing is mutated; the caller discards its side
                // effects.
                return Ok(FinalizeResult::StaleEpoch { expected, observed });
            }
        }

        let (status, control_state, last_error, control_reason) = match &outcome {
            DispatchOutcome::Completed => ("completed", None, None, None),
            DispatchOutcome::Failed { error } => {
                ("failed", None, Some(error.clone()), None)
            }
            DispatchOutcome::Cancelled { reason } => {
                ("cancelled", Some("cancelled"), None, reason.clone())
            }
        };

        let result = sqlx::query(
            r#"
            UPDATE run_dispatches SET
                status = $2,
                control_state = COALESCE($3, control_state),
                last_error = COALESCE($4, last_error),
                control_reason = COALESCE($5, control_reason),
                claimed_by = NULL,
                lease_expires_at = NULL,
                finished_at = $6
            WHERE id = $1
              AND status IN ('running', 'paused')
              AND claimed_epoch IS NOT DISTINCT FROM $7
            "#,
        )
        .bind(id.0)
        .bind(status)
        .bind(control_state)
        .bind(last_error)
        .bind(control_reason)
        .bind(now)
        .bind(expected.map(|e| e.as_i64()))
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(FinalizeResult::LostRace);
        }

        settle_lane(&mut tx, &queue_key, now).await?;
        tx.commit().await?;
        Ok(FinalizeResult::Applied)
    }

    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReapedDispatch>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            UPDATE run_dispatches SET
                status = 'abandoned',
                control_state = 'cancelled',
                last_error = 'lease expired; worker presumed dead',
                claimed_by = NULL,
                lease_expires_at = NULL,
                finished_at = $1
            WHERE status IN ('running', 'paused')
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at <= $1
            RETURNING id, queue_key
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut reaped = Vec::with_capacity(rows.len());
        for row in &rows {
            let queue_key: String = row.get("queue_key");
            settle_lane(&mut tx, &queue_key, now).await?;
            reaped.push(ReapedDispatch {
                dispatch_id: DispatchId(row.get("id")),
                queue_key: QueueKey::new(queue_key),
            });
        }
        tx.commit().await?;
        Ok(reaped)
    }

    async fn replay(
        &self,
        source_id: DispatchId,
        _actor: &str,
        _reason: &str,
        mode: ReplayMode,
    ) -> Result<ReplayOutcome, RepositoryError> {
        let tag = mode.reason_tag();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let source = sqlx::query(&format!(
            "SELECT {DISPATCH_COLUMNS} FROM run_dispatches WHERE id = $1"
        ))
        .bind(source_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("dispatch {source_id}")))?;
        let source = map_dispatch_row(&source)?;

        // Idempotency: an active replay with the same reason tag wins.
        let existing = sqlx::query(&format!(
            r#"
            SELECT {DISPATCH_COLUMNS} FROM run_dispatches
            WHERE replay_of_dispatch_id = $1
              AND control_reason = $2
              AND status IN ('queued', 'running', 'paused')
            ORDER BY created_at ASC
            LIMIT 1
            "#
        ))
        .bind(source_id.0)
        .bind(tag)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            let dispatch = map_dispatch_row(&row)?;
            return Ok(ReplayOutcome {
                dispatch,
                already_queued: true,
            });
        }

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
        sqlx::query(
            r#"
            INSERT INTO run_dispatches (
                id, run_key, queue_key, work_item_id, agent_id, session_key, job_id,
                status, control_state, input_text, coalesced_text, attempt_count,
                claimed_by, lease_expires_at, claimed_epoch, replay_of_dispatch_id,
                control_reason, last_error, created_at, started_at, finished_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, NULL,
                'queued', 'normal', $7, $8, $9,
                NULL, NULL, NULL, $10,
                $11, NULL, $12, NULL, NULL
            )
            "#,
        )
        .bind(replay.id.0)
        .bind(&replay.run_key)
        .bind(replay.queue_key.as_str())
        .bind(replay.work_item_id.0)
        .bind(replay.agent_id.0)
        .bind(replay.session_key.as_str())
        .bind(&replay.input_text)
        .bind(&replay.coalesced_text)
        .bind(replay.attempt_count)
        .bind(source_id.0)
        .bind(tag)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // Eligible for the very next claim cycle; a run already in flight
        // is not pre-empted.
        sqlx::query(
            r#"
            UPDATE queue_lanes SET
                state = CASE WHEN state = 'running' THEN state ELSE 'queued' END,
                debounce_until = $2,
                updated_at = $2
            WHERE queue_key = $1
            "#,
        )
        .bind(replay.queue_key.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ReplayOutcome {
            dispatch: replay,
            already_queued: false,
        })
    }

    async fn find_by_id(&self, id: DispatchId) -> Result<Option<RunDispatch>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DISPATCH_COLUMNS} FROM run_dispatches WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_dispatch_row).transpose()
    }
}

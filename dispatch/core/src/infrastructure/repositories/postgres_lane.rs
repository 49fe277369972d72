// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::dispatch::DispatchId;
use crate::domain::lane::{
    debounce_window, AgentId, LaneMode, LaneState, MessageId, MessageStatus, NewQueueMessage,
    QueueKey, QueueLane, QueueMessage, SessionKey, WorkItemId,
};
use crate::domain::repository::{QueueLaneRepository, RepositoryError};

pub struct PostgresQueueLaneRepository {
    pool: PgPool,
}

impl PostgresQueueLaneRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn map_lane_row(row: &sqlx::postgres::PgRow) -> Result<QueueLane, RepositoryError> {
    let state: String = row.get("state");
    let mode: String = row.get("mode");
    let active: Option<Uuid> = row.get("active_dispatch_id");
    Ok(QueueLane {
        queue_key: QueueKey::new(row.get::<String, _>("queue_key")),
        session_key: SessionKey::new(row.get::<String, _>("session_key")),
        agent_id: AgentId(row.get("agent_id")),
        plugin_instance_id: row.get("plugin_instance_id"),
        state: LaneState::parse(&state)
            .ok_or_else(|| RepositoryError::Database(format!("unknown lane state: {state}")))?,
        mode: LaneMode::parse(&mode)
            .ok_or_else(|| RepositoryError::Database(format!("unknown lane mode: {mode}")))?,
        is_paused: row.get("is_paused"),
        debounce_until: row.get("debounce_until"),
        debounce_ms: row.get("debounce_ms"),
        max_queued: row.get("max_queued"),
        active_dispatch_id: active.map(DispatchId),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn map_message_row(
    row: &sqlx::postgres::PgRow,
) -> Result<QueueMessage, RepositoryError> {
    let status: String = row.get("status");
    let dispatch_id: Option<Uuid> = row.get("dispatch_id");
    Ok(QueueMessage {
        id: MessageId(row.get("id")),
        queue_key: QueueKey::new(row.get::<String, _>("queue_key")),
        work_item_id: WorkItemId(row.get("work_item_id")),
        text: row.get("text"),
        sender_name: row.get("sender_name"),
        arrived_at: row.get("arrived_at"),
        status: MessageStatus::parse(&status).ok_or_else(|| {
            RepositoryError::Database(format!("unknown message status: {status}"))
        })?,
        dispatch_id: dispatch_id.map(DispatchId),
    })
}

#[async_trait]
impl QueueLaneRepository for PostgresQueueLaneRepository {
    async fn enqueue_message(
        &self,
        msg: NewQueueMessage,
    ) -> Result<QueueMessage, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let armed_until = msg.arrived_at + debounce_window(msg.debounce_ms);

        // Upsert the lane. Mode and the other creation-time attributes are
        // never overwritten on conflict; arrivals only push the debounce
        // window forward, and a running lane keeps running.
        sqlx::query(
            r#"
            INSERT INTO queue_lanes (
                queue_key, session_key, agent_id, plugin_instance_id,
                state, mode, is_paused, debounce_until, debounce_ms, max_queued,
                active_dispatch_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'queued', $5, FALSE, $6, $7, $8, NULL, $9, $9)
            ON CONFLICT (queue_key) DO UPDATE SET
                debounce_until = GREATEST(
                    queue_lanes.debounce_until,
                    $9 + make_interval(secs => CEIL(queue_lanes.debounce_ms / 1000.0))
                ),
                state = CASE WHEN queue_lanes.state = 'idle' THEN 'queued'
                             ELSE queue_lanes.state END,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(msg.queue_key.as_str())
        .bind(msg.session_key.as_str())
        .bind(msg.agent_id.0)
        .bind(&msg.plugin_instance_id)
        .bind(msg.mode.as_str())
        .bind(armed_until)
        .bind(msg.debounce_ms)
        .bind(msg.max_queued)
        .bind(msg.arrived_at)
        .execute(&mut *tx)
        .await?;

        let message = QueueMessage {
            id: MessageId::new(),
            queue_key: msg.queue_key,
            work_item_id: msg.work_item_id,
            text: msg.text,
            sender_name: msg.sender_name,
            arrived_at: msg.arrived_at,
            status: MessageStatus::Pending,
            dispatch_id: None,
        };
        sqlx::query(
            r#"
            INSERT INTO queue_messages (
                id, queue_key, work_item_id, text, sender_name, arrived_at, status, dispatch_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', NULL)
            "#,
        )
        .bind(message.id.0)
        .bind(message.queue_key.as_str())
        .bind(message.work_item_id.0)
        .bind(&message.text)
        .bind(&message.sender_name)
        .bind(message.arrived_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn find_lane(&self, key: &QueueKey) -> Result<Option<QueueLane>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT queue_key, session_key, agent_id, plugin_instance_id,
                   state, mode, is_paused, debounce_until, debounce_ms, max_queued,
                   active_dispatch_id, created_at, updated_at
            FROM queue_lanes
            WHERE queue_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_lane_row).transpose()
    }

    async fn pending_messages(
        &self,
        key: &QueueKey,
    ) -> Result<Vec<QueueMessage>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue_key, work_item_id, text, sender_name, arrived_at, status, dispatch_id
            FROM queue_messages
            WHERE queue_key = $1 AND status = 'pending'
            ORDER BY arrived_at ASC, id ASC
            "#,
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_message_row).collect()
    }

    async fn pause_lane(&self, key: &QueueKey) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_lanes
            SET is_paused = TRUE, updated_at = $2
            WHERE queue_key = $1
            "#,
        )
        .bind(key.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn resume_lane(&self, key: &QueueKey) -> Result<bool, RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let pending: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM queue_messages
            WHERE queue_key = $1 AND status = 'pending'
            "#,
        )
        .bind(key.as_str())
        .fetch_one(&mut *tx)
        .await?
        .get("n");

        // State is re-derived from whether a dispatch is active; the
        // debounce window is re-armed only if it was cleared.
        let result = sqlx::query(
            r#"
            UPDATE queue_lanes
            SET is_paused = FALSE,
                state = CASE
                    WHEN active_dispatch_id IS NOT NULL THEN 'running'
                    WHEN $2 THEN 'queued'
                    ELSE 'idle'
                END,
                debounce_until = CASE
                    WHEN active_dispatch_id IS NULL AND $2 AND debounce_until IS NULL
                        THEN $3 + make_interval(secs => CEIL(debounce_ms / 1000.0))
                    ELSE debounce_until
                END,
                updated_at = $3
            WHERE queue_key = $1
            "#,
        )
        .bind(key.as_str())
        .bind(pending > 0)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! PostgreSQL implementation of the effect outbox.
//!
//! The same fencing pattern as dispatch finalize: claims stamp the live
//! control epoch, and the mark operations re-check it so a worker disowned
//! by a global epoch bump cannot land a late, possibly duplicate external
//! effect. Ambiguous outcomes park in `unknown` and stay there until an
//! operator releases or cancels them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::control::ControlEpoch;
use crate::domain::dispatch::DispatchId;
use crate::domain::lane::WorkItemId;
use crate::domain::lease::{Lease, WorkerId};
use crate::domain::outbox::{EffectId, EffectOutboxEntry, EffectPayload, EffectStatus, NewEffect};
use crate::domain::repository::{EffectMarkResult, EffectOutboxRepository, RepositoryError};

const EFFECT_COLUMNS: &str = r#"
    id, work_item_id, dispatch_id, payload, status, retryable, next_attempt_at,
    attempt_count, claimed_by, lease_expires_at, claimed_epoch, provider_ref,
    last_error, unknown_reason, created_at, sent_at
"#;

pub struct PostgresEffectOutboxRepository {
    pool: PgPool,
}

impl PostgresEffectOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn live_epoch(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<ControlEpoch, RepositoryError> {
        let epoch: i64 = sqlx::query("SELECT control_epoch FROM runtime_control WHERE id = 1")
            .fetch_optional(&mut **tx)
            .await?
            .map(|r| r.get("control_epoch"))
            .unwrap_or(0);
        Ok(ControlEpoch(epoch))
    }
}

fn map_effect_row(row: &sqlx::postgres::PgRow) -> Result<EffectOutboxEntry, RepositoryError> {
    let status: String = row.get("status");
    let payload: serde_json::Value = row.get("payload");
    let claimed_by: Option<String> = row.get("claimed_by");
    let lease_expires_at: Option<DateTime<Utc>> = row.get("lease_expires_at");
    let claimed_epoch: Option<i64> = row.get("claimed_epoch");

    Ok(EffectOutboxEntry {
        id: EffectId(row.get("id")),
        work_item_id: WorkItemId(row.get("work_item_id")),
        dispatch_id: DispatchId(row.get("dispatch_id")),
        payload: serde_json::from_value::<EffectPayload>(payload)?,
        status: EffectStatus::parse(&status).ok_or_else(|| {
            RepositoryError::Database(format!("unknown effect status: {status}"))
        })?,
        retryable: row.get("retryable"),
        next_attempt_at: row.get("next_attempt_at"),
        attempt_count: row.get("attempt_count"),
        lease: match (claimed_by, lease_expires_at) {
            (Some(holder), Some(expires_at)) => Some(Lease {
                holder: WorkerId::new(holder),
                expires_at,
            }),
            _ => None,
        },
        claimed_epoch: claimed_epoch.map(ControlEpoch),
        provider_ref: row.get("provider_ref"),
        last_error: row.get("last_error"),
        unknown_reason: row.get("unknown_reason"),
        created_at: row.get("created_at"),
        sent_at: row.get("sent_at"),
    })
}

#[async_trait]
impl EffectOutboxRepository for PostgresEffectOutboxRepository {
    async fn enqueue(&self, effect: NewEffect) -> Result<EffectOutboxEntry, RepositoryError> {
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
        let payload_json = serde_json::to_value(&entry.payload)?;
        sqlx::query(
            r#"
            INSERT INTO effect_outbox (
                id, work_item_id, dispatch_id, payload, status, retryable,
                next_attempt_at, attempt_count, claimed_by, lease_expires_at,
                claimed_epoch, provider_ref, last_error, unknown_reason,
                created_at, sent_at
            )
            VALUES (
                $1, $2, $3, $4, 'pending', TRUE,
                NULL, 0, NULL, NULL,
                NULL, NULL, NULL, NULL,
                $5, NULL
            )
            "#,
        )
        .bind(entry.id.0)
        .bind(entry.work_item_id.0)
        .bind(entry.dispatch_id.0)
        .bind(payload_json)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn claim_next(
        &self,
        worker: &WorkerId,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<EffectOutboxEntry>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let epoch = Self::live_epoch(&mut tx).await?;

        // Oldest deliverable entry; the CAS carries the same predicate, so
        // a lost race shows up as zero rows.
        let row = sqlx::query(&format!(
            r#"
            UPDATE effect_outbox SET
                status = 'sending',
                attempt_count = attempt_count + 1,
                claimed_by = $1,
                lease_expires_at = $2,
                claimed_epoch = $3
            WHERE id = (
                SELECT id FROM effect_outbox
                WHERE status = 'pending'
                   OR (status = 'failed' AND retryable
                       AND (next_attempt_at IS NULL OR next_attempt_at <= $4))
                ORDER BY created_at ASC
                LIMIT 1
            )
              AND status IN ('pending', 'failed')
            RETURNING {EFFECT_COLUMNS}
            "#
        ))
        .bind(worker.as_str())
        .bind(now + lease_ttl)
        .bind(epoch.as_i64())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        row.as_ref().map(map_effect_row).transpose()
    }

    async fn mark_sent(
        &self,
        id: EffectId,
        provider_ref: &str,
        expected_epoch: Option<ControlEpoch>,
    ) -> Result<EffectMarkResult, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        if let Some(expected) = expected_epoch {
            let observed = Self::live_epoch(&mut tx).await?;
            if expected != observed {
                return Ok(EffectMarkResult::StaleEpoch { expected, observed });
            }
        }
        let result = sqlx::query(
            r#"
            UPDATE effect_outbox SET
                status = 'sent',
                provider_ref = $2,
                sent_at = $3,
                claimed_by = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id.0)
        .bind(provider_ref)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Ok(EffectMarkResult::LostRace);
        }
        Ok(EffectMarkResult::Applied)
    }

    async fn mark_failed(
        &self,
        id: EffectId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        expected_epoch: Option<ControlEpoch>,
    ) -> Result<EffectMarkResult, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        if let Some(expected) = expected_epoch {
            let observed = Self::live_epoch(&mut tx).await?;
            if expected != observed {
                return Ok(EffectMarkResult::StaleEpoch { expected, observed });
            }
        }
        let result = sqlx::query(
            r#"
            UPDATE effect_outbox SET
                status = 'failed',
                retryable = $2,
                next_attempt_at = $3,
                last_error = $4,
                claimed_by = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id.0)
        .bind(retry_at.is_some())
        .bind(retry_at)
        .bind(error)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Ok(EffectMarkResult::LostRace);
        }
        Ok(EffectMarkResult::Applied)
    }

    async fn mark_unknown(
        &self,
        id: EffectId,
        reason: &str,
        expected_epoch: Option<ControlEpoch>,
    ) -> Result<EffectMarkResult, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        if let Some(expected) = expected_epoch {
            let observed = Self::live_epoch(&mut tx).await?;
            if expected != observed {
                return Ok(EffectMarkResult::StaleEpoch { expected, observed });
            }
        }
        let result = sqlx::query(
            r#"
            UPDATE effect_outbox SET
                status = 'unknown',
                unknown_reason = $2,
                claimed_by = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id.0)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Ok(EffectMarkResult::LostRace);
        }
        Ok(EffectMarkResult::Applied)
    }

    async fn release_unknown(&self, id: EffectId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE effect_outbox SET
                status = 'pending',
                retryable = TRUE,
                next_attempt_at = NULL,
                claimed_by = NULL,
                lease_expires_at = NULL,
                claimed_epoch = NULL
            WHERE id = $1 AND status = 'unknown'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel(&self, id: EffectId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE effect_outbox SET status = 'cancelled'
            WHERE id = $1 AND status IN ('pending', 'failed', 'unknown')
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel_pending_by_dispatch(
        &self,
        dispatch_id: DispatchId,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE effect_outbox SET status = 'cancelled'
            WHERE dispatch_id = $1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(dispatch_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_stale_sending_unknown(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        // Sending entries whose lease lapsed move to unknown, never back to
        // pending: the external call may already have landed.
        let result = sqlx::query(
            r#"
            UPDATE effect_outbox SET
                status = 'unknown',
                unknown_reason = 'lease expired while sending; outcome unknown',
                claimed_by = NULL,
                lease_expires_at = NULL
            WHERE status = 'sending'
              AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_by_id(
        &self,
        id: EffectId,
    ) -> Result<Option<EffectOutboxEntry>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EFFECT_COLUMNS} FROM effect_outbox WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_effect_row).transpose()
    }

    async fn find_by_dispatch(
        &self,
        dispatch_id: DispatchId,
    ) -> Result<Vec<EffectOutboxEntry>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EFFECT_COLUMNS} FROM effect_outbox
             WHERE dispatch_id = $1 ORDER BY created_at ASC"
        ))
        .bind(dispatch_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_effect_row).collect()
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::control::{ControlEpoch, PauseMode, RuntimeControl};
use crate::domain::repository::{RepositoryError, RuntimeControlRepository};

/// Fixed primary key of the singleton row.
const CONTROL_ROW_ID: i32 = 1;

pub struct PostgresRuntimeControlRepository {
    pool: PgPool,
}

impl PostgresRuntimeControlRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the singleton row if absent. Safe to race; the conflict
    /// target makes it idempotent.
    pub(crate) async fn ensure_row<'e, E>(executor: E) -> Result<(), RepositoryError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let defaults = RuntimeControl::default();
        sqlx::query(
            r#"
            INSERT INTO runtime_control (
                id, processing_enabled, pause_mode, control_epoch, max_concurrent_dispatches
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(CONTROL_ROW_ID)
        .bind(defaults.processing_enabled)
        .bind(defaults.pause_mode.as_str())
        .bind(defaults.control_epoch.as_i64())
        .bind(defaults.max_concurrent_dispatches)
        .execute(executor)
        .await?;
        Ok(())
    }

    fn map_row(row: &sqlx::postgres::PgRow) -> Result<RuntimeControl, RepositoryError> {
        let pause_mode: String = row.get("pause_mode");
        Ok(RuntimeControl {
            processing_enabled: row.get("processing_enabled"),
            pause_mode: PauseMode::parse(&pause_mode).ok_or_else(|| {
                RepositoryError::Database(format!("unknown pause mode: {pause_mode}"))
            })?,
            control_epoch: ControlEpoch(row.get("control_epoch")),
            max_concurrent_dispatches: row.get("max_concurrent_dispatches"),
        })
    }
}

#[async_trait]
impl RuntimeControlRepository for PostgresRuntimeControlRepository {
    async fn get_or_init(&self) -> Result<RuntimeControl, RepositoryError> {
        Self::ensure_row(&self.pool).await?;
        let row = sqlx::query(
            r#"
            SELECT processing_enabled, pause_mode, control_epoch, max_concurrent_dispatches
            FROM runtime_control
            WHERE id = $1
            "#,
        )
        .bind(CONTROL_ROW_ID)
        .fetch_one(&self.pool)
        .await?;
        Self::map_row(&row)
    }

    async fn current_epoch(&self) -> Result<ControlEpoch, RepositoryError> {
        Ok(self.get_or_init().await?.control_epoch)
    }

    async fn bump_epoch(&self) -> Result<ControlEpoch, RepositoryError> {
        Self::ensure_row(&self.pool).await?;
        let row = sqlx::query(
            r#"
            UPDATE runtime_control
            SET control_epoch = control_epoch + 1
            WHERE id = $1
            RETURNING control_epoch
            "#,
        )
        .bind(CONTROL_ROW_ID)
        .fetch_one(&self.pool)
        .await?;
        Ok(ControlEpoch(row.get("control_epoch")))
    }

    async fn set_processing_enabled(
        &self,
        enabled: bool,
        mode: PauseMode,
    ) -> Result<RuntimeControl, RepositoryError> {
        Self::ensure_row(&self.pool).await?;
        let row = sqlx::query(
            r#"
            UPDATE runtime_control
            SET processing_enabled = $2, pause_mode = $3
            WHERE id = $1
            RETURNING processing_enabled, pause_mode, control_epoch, max_concurrent_dispatches
            "#,
        )
        .bind(CONTROL_ROW_ID)
        .bind(enabled)
        .bind(mode.as_str())
        .fetch_one(&self.pool)
        .await?;
        Self::map_row(&row)
    }

    async fn set_max_concurrent_dispatches(
        &self,
        limit: i32,
    ) -> Result<RuntimeControl, RepositoryError> {
        Self::ensure_row(&self.pool).await?;
        let row = sqlx::query(
            r#"
            UPDATE runtime_control
            SET max_concurrent_dispatches = $2
            WHERE id = $1
            RETURNING processing_enabled, pause_mode, control_epoch, max_concurrent_dispatches
            "#,
        )
        .bind(CONTROL_ROW_ID)
        .bind(limit)
        .fetch_one(&self.pool)
        .await?;
        Self::map_row(&row)
    }
}

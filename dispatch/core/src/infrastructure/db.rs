// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Connection Pool
//!
//! Wraps `sqlx::postgres::PgPool` in a thin `Database` newtype and acts as
//! the composition point for the PostgreSQL repository set. In-memory
//! repositories are used for development and testing; PostgreSQL for
//! production deployments.

use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::infrastructure::repositories::{
    PostgresEffectOutboxRepository, PostgresQueueLaneRepository, PostgresRunDispatchRepository,
    PostgresRuntimeControlRepository,
};

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn runtime_control(&self) -> PostgresRuntimeControlRepository {
        PostgresRuntimeControlRepository::new(self.pool.clone())
    }

    pub fn queue_lanes(&self) -> PostgresQueueLaneRepository {
        PostgresQueueLaneRepository::new(self.pool.clone())
    }

    pub fn run_dispatches(&self) -> PostgresRunDispatchRepository {
        PostgresRunDispatchRepository::new(self.pool.clone())
    }

    pub fn effect_outbox(&self) -> PostgresEffectOutboxRepository {
        PostgresEffectOutboxRepository::new(self.pool.clone())
    }
}

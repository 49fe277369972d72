// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lease reaper.
//!
//! Periodic sweep reconciling work whose worker died mid-flight: expired
//! dispatch leases become `abandoned` (freeing their lanes), and stale
//! `sending` outbox entries become `unknown`. This bounds how long a
//! crashed worker can wedge a lane, without ever guessing the outcome of
//! an in-flight external call.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::config::DispatchConfig;
use crate::domain::events::DispatchEvent;
use crate::domain::repository::{EffectOutboxRepository, RunDispatchRepository};
use crate::infrastructure::event_bus::EventBus;

pub struct LeaseReaper {
    dispatches: Arc<dyn RunDispatchRepository>,
    outbox: Arc<dyn EffectOutboxRepository>,
    events: EventBus,
    config: DispatchConfig,
}

impl LeaseReaper {
    pub fn new(
        dispatches: Arc<dyn RunDispatchRepository>,
        outbox: Arc<dyn EffectOutboxRepository>,
        events: EventBus,
        config: DispatchConfig,
    ) -> Self {
        Self {
            dispatches,
            outbox,
            events,
            config,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("lease reaper started");
        let mut ticks = tokio::time::interval(self.config.reaper_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("lease reaper stopping");
                    return Ok(());
                }
                _ = ticks.tick() => {
                    self.sweep_once().await?;
                }
            }
        }
    }

    /// One sweep. Idempotent; a dispatch is abandoned at most once.
    pub async fn sweep_once(&self) -> Result<()> {
        let now = Utc::now();

        let reaped = self.dispatches.reap_expired(now).await?;
        for r in &reaped {
            warn!(
                dispatch = %r.dispatch_id,
                queue_key = %r.queue_key,
                "abandoned dispatch with expired lease"
            );
            self.events.publish_dispatch_event(DispatchEvent::Reaped {
                dispatch_id: r.dispatch_id,
                queue_key: r.queue_key.clone(),
            });
        }
        if !reaped.is_empty() {
            counter!("aegis_dispatch_reaped_total").increment(reaped.len() as u64);
        }

        let stale = self.outbox.mark_stale_sending_unknown(now).await?;
        if stale > 0 {
            warn!(count = stale, "stale sending effects moved to unknown");
            counter!("aegis_effect_stale_sending_total").increment(stale);
        }

        Ok(())
    }
}

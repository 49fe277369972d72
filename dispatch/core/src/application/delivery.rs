// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Effect delivery loop.
//!
//! Claims outbox entries and hands them to an `EffectSender` (the adapter
//! that actually talks to the chat/media provider). The sender reports one
//! of three outcomes and the entry is marked accordingly, fenced by the
//! epoch stamped at claim time. Ambiguity is preserved: an `Unknown`
//! outcome parks the entry and nothing retries it automatically.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::config::DispatchConfig;
use crate::domain::events::EffectEvent;
use crate::domain::lease::WorkerId;
use crate::domain::outbox::{retry_backoff, EffectOutboxEntry, EffectStatus};
use crate::domain::repository::{EffectMarkResult, EffectOutboxRepository};
use crate::infrastructure::event_bus::EventBus;

/// The adapter's verdict on one delivery attempt.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// The provider confirmed the effect; `provider_ref` is its handle.
    Sent { provider_ref: String },
    /// The call definitely did not take effect. `retryable` reflects the
    /// failure's nature (e.g. rate limit vs. malformed payload).
    Failed { error: String, retryable: bool },
    /// The outcome cannot be determined (e.g. timeout after the request
    /// went out). The entry must park, not retry.
    Unknown { reason: String },
}

/// Seam to the concrete provider adapter (chat send, media post).
#[async_trait]
pub trait EffectSender: Send + Sync {
    async fn deliver(&self, entry: &EffectOutboxEntry) -> DeliveryOutcome;
}

pub struct EffectDeliveryService {
    worker_id: WorkerId,
    outbox: Arc<dyn EffectOutboxRepository>,
    sender: Arc<dyn EffectSender>,
    events: EventBus,
    config: DispatchConfig,
}

impl EffectDeliveryService {
    pub fn new(
        worker_id: WorkerId,
        outbox: Arc<dyn EffectOutboxRepository>,
        sender: Arc<dyn EffectSender>,
        events: EventBus,
        config: DispatchConfig,
    ) -> Self {
        Self {
            worker_id,
            outbox,
            sender,
            events,
            config,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(worker = %self.worker_id, "effect delivery started");
        loop {
            if shutdown.is_cancelled() {
                info!(worker = %self.worker_id, "effect delivery stopping");
                return Ok(());
            }
            if !self.run_once().await? {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                }
            }
        }
    }

    /// One claim-deliver-mark cycle. Returns whether an entry was claimed.
    pub async fn run_once(&self) -> Result<bool> {
        let entry = self
            .outbox
            .claim_next(
                &self.worker_id,
                self.config.effect_lease_ttl_chrono(),
                Utc::now(),
            )
            .await?;
        let Some(entry) = entry else {
            return Ok(false);
        };
        counter!("aegis_effect_claims_total").increment(1);
        self.events.publish_effect_event(EffectEvent::Claimed {
            effect_id: entry.id,
            attempt: entry.attempt_count,
        });

        let outcome = self.sender.deliver(&entry).await;
        let mark = match &outcome {
            DeliveryOutcome::Sent { provider_ref } => {
                self.outbox
                    .mark_sent(entry.id, provider_ref, entry.claimed_epoch)
                    .await?
            }
            DeliveryOutcome::Failed { error, retryable } => {
                let retry_at = retryable.then(|| {
                    Utc::now()
                        + retry_backoff(
                            entry.attempt_count,
                            self.config.retry_backoff_base_chrono(),
                            self.config.retry_backoff_cap_chrono(),
                        )
                });
                self.outbox
                    .mark_failed(entry.id, error, retry_at, entry.claimed_epoch)
                    .await?
            }
            DeliveryOutcome::Unknown { reason } => {
                // No epoch fence here: recording ambiguity is safe even for
                // a disowned worker, and parking the entry beats leaving it
                // in `sending` for the stale sweep.
                self.outbox.mark_unknown(entry.id, reason, None).await?
            }
        };

        match mark {
            EffectMarkResult::Applied => {
                let status = match &outcome {
                    DeliveryOutcome::Sent { .. } => EffectStatus::Sent,
                    DeliveryOutcome::Failed { .. } => EffectStatus::Failed,
                    DeliveryOutcome::Unknown { .. } => EffectStatus::Unknown,
                };
                counter!("aegis_effect_resolved_total", "status" => status.as_str())
                    .increment(1);
                if let DeliveryOutcome::Unknown { reason } = outcome {
                    warn!(effect = %entry.id, reason, "effect outcome unknown; operator review required");
                    self.events.publish_effect_event(EffectEvent::MarkedUnknown {
                        effect_id: entry.id,
                        reason,
                    });
                } else {
                    self.events.publish_effect_event(EffectEvent::Resolved {
                        effect_id: entry.id,
                        status,
                    });
                }
            }
            EffectMarkResult::StaleEpoch { expected, observed } => {
                warn!(
                    effect = %entry.id,
                    expected = %expected,
                    observed = %observed,
                    "effect mark rejected by stale epoch"
                );
                counter!("aegis_effect_stale_epoch_total").increment(1);
            }
            EffectMarkResult::LostRace => {
                warn!(effect = %entry.id, "effect already left sending; mark skipped");
            }
        }
        Ok(true)
    }
}

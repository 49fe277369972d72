// Event Bus Implementation - Pub/Sub for Dispatch Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Enables real-time observation of scheduler activity by CLI, SSE
// endpoints, and audit observers. In-memory only; events are lost on
// restart. The durable record lives in the dispatch and outbox tables.

use crate::domain::events::{DispatchEvent, EffectEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Unified event type for the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    Dispatch(DispatchEvent),
    Effect(EffectEvent),
}

/// Event bus for publishing and subscribing to dispatch-core events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<CoreEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity.
    /// Capacity determines how many events can be buffered before dropping
    /// old ones.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_dispatch_event(&self, event: DispatchEvent) {
        self.publish(CoreEvent::Dispatch(event));
    }

    pub fn publish_effect_event(&self, event: EffectEvent) {
        self.publish(CoreEvent::Effect(event));
    }

    fn publish(&self, event: CoreEvent) {
        // Returns Err only when there are no subscribers; that is fine.
        let receivers = self.sender.receiver_count();
        if self.sender.send(event).is_ok() {
            debug!(receivers, "published core event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::dispatch::DispatchId;
    use crate::domain::lane::QueueKey;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::with_default_capacity();
        let mut rx = bus.subscribe();

        bus.publish_dispatch_event(DispatchEvent::Reaped {
            dispatch_id: DispatchId::new(),
            queue_key: QueueKey::new("s1:a1"),
        });

        match rx.recv().await.unwrap() {
            CoreEvent::Dispatch(DispatchEvent::Reaped { queue_key, .. }) => {
                assert_eq!(queue_key, QueueKey::new("s1:a1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

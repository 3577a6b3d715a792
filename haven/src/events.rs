//! Process-wide event bus
//!
//! Typed publish/subscribe over a tokio broadcast channel. Subscribers
//! observe events in publish order, each at its own pace; dropping the
//! receiver unsubscribes.

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    ServiceRegistered { name: String },
    ServiceInit { name: String },
    ServiceStart { name: String },
    ServiceStop { name: String },
    ServiceError { name: String, message: String },
    ServiceCrashed { name: String },
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    TrustUpdated { peer_id: String },
    EnvelopeDelivered { from: String, kind: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget publish; an event with no subscribers is fine.
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(NodeEvent::ServiceStart { name: "a".into() });
        bus.publish(NodeEvent::ServiceStop { name: "a".into() });

        assert_eq!(
            rx.recv().await.unwrap(),
            NodeEvent::ServiceStart { name: "a".into() }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            NodeEvent::ServiceStop { name: "a".into() }
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(16);
        bus.publish(NodeEvent::ServiceCrashed { name: "x".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}

use crate::types::EngineEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FlowId;

    #[tokio::test]
    async fn every_subscriber_sees_events() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(EngineEvent::FlowRetired {
            flow_id: FlowId::from_string("f"),
            version: 2,
        });
        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                EngineEvent::FlowRetired { version, .. } => assert_eq!(version, 2),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::SampleRejected {
            source: "s".into(),
            reason: "empty".into(),
        });
    }
}

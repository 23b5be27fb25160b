//! Event bus distributing `AnimaEvent`s to subscribers (§4.9).

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::events::{AnimaEvent, EventKind};

const DEFAULT_CAPACITY: usize = 1024;

/// Fire-and-forget broadcast of every observable core state change.
/// Subscribers are single-producer-single-consumer lazy sequences; a slow
/// subscriber may lag and miss messages, but only `agent-stream-chunk` is
/// expected to be dropped in practice (§4.9).
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AnimaEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnimaEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers. Never blocks, never panics: if no
    /// subscribers are connected the event is silently dropped.
    pub fn emit(&self, project_id: Uuid, kind: EventKind, payload: serde_json::Value) {
        let event = AnimaEvent::new(project_id, kind, Utc::now(), payload);
        match self.sender.send(event) {
            Ok(n) => debug!(%project_id, ?kind, subscribers = n, "event emitted"),
            Err(_) => { /* no subscribers; expected and fine */ }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscriber_does_not_panic() {
        let bus = EventBus::default();
        bus.emit(Uuid::new_v4(), EventKind::StatusChange, serde_json::Value::Null);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn subscriber_receives_emitted_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let project_id = Uuid::new_v4();

        bus.emit(project_id, EventKind::Verdict, serde_json::json!({"verdict": "accepted"}));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.project_id, project_id);
        assert_eq!(event.kind, EventKind::Verdict);
        assert_eq!(event.payload["verdict"], "accepted");
    }

    #[test]
    fn multiple_subscribers_all_receive() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        let project_id = Uuid::new_v4();

        bus.emit(project_id, EventKind::RoundStarted, serde_json::Value::Null);

        assert_eq!(rx1.try_recv().unwrap().project_id, project_id);
        assert_eq!(rx2.try_recv().unwrap().project_id, project_id);
    }

    #[test]
    fn dropped_subscriber_does_not_affect_others() {
        let bus = EventBus::default();
        let rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        drop(rx1);
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(Uuid::new_v4(), EventKind::Recovered, serde_json::Value::Null);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn clone_shares_the_same_channel() {
        let bus = EventBus::default();
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();
        let project_id = Uuid::new_v4();

        bus2.emit(project_id, EventKind::QuotaEvent, serde_json::Value::Null);
        assert_eq!(rx.try_recv().unwrap().project_id, project_id);
    }
}

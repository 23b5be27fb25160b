//! Event bus payload types (§4.9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of an observable core state change. Every kind is paired with a
/// `projectId`, timestamp, and free-form JSON payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    StatusChange,
    MilestoneStatusChange,
    RoundStarted,
    RoundFinished,
    Verdict,
    AgentStreamChunk,
    QuotaEvent,
    Recovered,
}

/// A single event on the bus: `{projectId, kind, timestamp, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimaEvent {
    pub project_id: Uuid,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl AnimaEvent {
    pub fn new(project_id: Uuid, kind: EventKind, timestamp: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            project_id,
            kind,
            timestamp,
            payload,
        }
    }

    /// `agent-stream-chunk` is the one kind a slow subscriber may drop
    /// (§4.9); every other kind is terminal or state-carrying.
    pub fn is_droppable(&self) -> bool {
        matches!(self.kind, EventKind::AgentStreamChunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&EventKind::MilestoneStatusChange).unwrap(),
            "\"milestone-status-change\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::AgentStreamChunk).unwrap(),
            "\"agent-stream-chunk\""
        );
    }

    #[test]
    fn only_agent_stream_chunk_is_droppable() {
        let project_id = Uuid::new_v4();
        let now = Utc::now();
        for kind in [
            EventKind::StatusChange,
            EventKind::MilestoneStatusChange,
            EventKind::RoundStarted,
            EventKind::RoundFinished,
            EventKind::Verdict,
            EventKind::QuotaEvent,
            EventKind::Recovered,
        ] {
            let event = AnimaEvent::new(project_id, kind, now, serde_json::Value::Null);
            assert!(!event.is_droppable(), "{kind:?} must not be droppable");
        }
        let chunk = AnimaEvent::new(project_id, EventKind::AgentStreamChunk, now, serde_json::Value::Null);
        assert!(chunk.is_droppable());
    }

    #[test]
    fn serde_roundtrip_preserves_fields() {
        let project_id = Uuid::new_v4();
        let now = Utc::now();
        let event = AnimaEvent::new(
            project_id,
            EventKind::Verdict,
            now,
            serde_json::json!({"verdict": "accepted"}),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: AnimaEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.project_id, project_id);
        assert_eq!(back.kind, EventKind::Verdict);
        assert_eq!(back.payload["verdict"], "accepted");
    }
}

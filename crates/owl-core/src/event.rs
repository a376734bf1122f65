use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle phase of a node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePhase {
    Start,
    Success,
    Error,
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Structured event emitted once per phase per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub run_id: Uuid,
    pub node_id: String,
    pub phase: NodePhase,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

impl NodeEvent {
    pub fn new(
        run_id: Uuid,
        node_id: impl Into<String>,
        phase: NodePhase,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            phase,
            timestamp: Utc::now(),
            detail: detail.into(),
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: NodeEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
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

    #[test]
    fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let run_id = Uuid::new_v4();
        bus.publish(NodeEvent::new(run_id, "n1", NodePhase::Start, ""));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.run_id, run_id);
        assert_eq!(event.node_id, "n1");
        assert_eq!(event.phase, NodePhase::Start);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(NodeEvent::new(Uuid::new_v4(), "n1", NodePhase::Error, "boom"));
    }

    #[test]
    fn phase_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&NodePhase::Success).unwrap(), "\"success\"");
        assert_eq!(NodePhase::Error.to_string(), "error");
    }
}

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::edge::EdgeType;
use crate::model::node::NodeType;

// ---------------------------------------------------------------------------
// GraphEvent: surface-level notifications for external observers
// ---------------------------------------------------------------------------

/// An observable event emitted by the engine after a mutation (or lifecycle
/// transition) has fully committed to the store, indexes, and cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum GraphEvent {
    NodeAdded { id: Uuid, node_type: NodeType },
    NodeUpdated { id: Uuid },
    NodeDeleted { id: Uuid },
    EdgeAdded {
        id: Uuid,
        source: Uuid,
        target: Uuid,
        edge_type: EdgeType,
    },
    EdgeUpdated { id: Uuid },
    EdgeDeleted { id: Uuid },
    Initialized,
    Shutdown,
}

/// Broadcast fan-out for [`GraphEvent`]s.
///
/// Emission is fire-and-forget: an event with no live subscribers is simply
/// dropped, and a slow subscriber lags rather than blocking writers.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<GraphEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: GraphEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

//! Feedback event fan-out.
//!
//! Command acks/results, lease lifecycle, and service lifecycle events all
//! flow through one broadcast channel to `/ws/feedback` subscribers. Slow
//! subscribers lag and drop rather than buffering unboundedly.

use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Shared feedback event hub.
#[derive(Clone)]
pub struct FeedbackHub {
    tx: broadcast::Sender<Value>,
}

impl FeedbackHub {
    /// Create a hub with a bounded fan-out buffer.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Subscribe to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }

    /// Publish an arbitrary event.
    pub fn send(&self, event: Value) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Command accepted and dispatched to the backend.
    pub fn cmd_ack(&self, cmd_id: &str) {
        self.send(json!({"type": "cmd_ack", "cmd_id": cmd_id, "status": "accepted"}));
    }

    /// Command finished.
    pub fn cmd_result(&self, cmd_id: &str, status: &str) {
        self.send(json!({"type": "cmd_result", "cmd_id": cmd_id, "status": status}));
    }

    /// Service lifecycle transition.
    pub fn service_event(&self, event: &str, key: &str) {
        self.send(json!({"type": event, "service": key}));
    }
}

impl Default for FeedbackHub {
    fn default() -> Self {
        Self::new()
    }
}

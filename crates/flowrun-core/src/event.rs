use tracing::debug;

use crate::traits::ProgressObserver;
use crate::types::ProgressEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all progress events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ProgressEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressObserver for EventBus {
    fn on_progress(&self, event: &ProgressEvent) {
        self.publish(event.clone());
    }
}

/// Observer that writes every transition to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        debug!(
            node_id = %event.node_id,
            status = ?event.status,
            detail = %serde_json::Value::Object(event.detail.clone()),
            "progress"
        );
    }
}

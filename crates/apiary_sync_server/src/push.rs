//! Push channel over the WebSocket connections held by this process.

use apiary_sync::transport::{PushChannel, PushError};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound frame queues of the sockets connected to this process, by connection ID.
#[derive(Default)]
pub struct ConnectionRegistry {
    senders: DashMap<String, mpsc::UnboundedSender<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the receiving end of its frame queue.
    pub fn register(&self, connection_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(connection_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, connection_id: &str) {
        self.senders.remove(connection_id);
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

#[async_trait]
impl PushChannel for ConnectionRegistry {
    async fn post_to_connection(&self, connection_id: &str, data: &str) -> Result<(), PushError> {
        let sender = self
            .senders
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PushError::Gone(connection_id.to_string()))?;

        sender.send(data.to_string()).map_err(|_| {
            debug!("Frame queue for {} is closed", connection_id);
            PushError::Gone(connection_id.to_string())
        })
    }
}

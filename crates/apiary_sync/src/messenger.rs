//! Message delivery to connected devices.

use crate::error::{Result, SyncError};
use crate::protocol::ServerMessage;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Best-effort push delivery of server messages to connections.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send `message` to every connection in `connection_ids` except `exclude`.
    ///
    /// Returns the connections the transport reported as gone. They do not
    /// fail delivery to the others.
    async fn send_message(
        &self,
        connection_ids: &[String],
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Result<Vec<String>>;
}

/// Messenger that records every delivery per connection instead of sending it.
#[derive(Default)]
pub struct MemoryMessenger {
    messages: Mutex<HashMap<String, Vec<ServerMessage>>>,
    gone: Mutex<HashSet<String>>,
}

impl MemoryMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages delivered to a connection, oldest first.
    pub fn messages_for(&self, connection_id: &str) -> Vec<ServerMessage> {
        self.messages
            .lock()
            .map(|messages| messages.get(connection_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Report `connection_id` as gone on every later delivery.
    pub fn mark_gone(&self, connection_id: &str) {
        if let Ok(mut gone) = self.gone.lock() {
            gone.insert(connection_id.to_string());
        }
    }
}

#[async_trait]
impl Messenger for MemoryMessenger {
    async fn send_message(
        &self,
        connection_ids: &[String],
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Result<Vec<String>> {
        let poisoned = || SyncError::Messenger("Failed to lock in-memory messenger".to_string());
        let gone = self.gone.lock().map_err(|_| poisoned())?;
        let mut messages = self.messages.lock().map_err(|_| poisoned())?;
        let mut unreachable = Vec::new();
        for id in connection_ids {
            if Some(id.as_str()) == exclude {
                continue;
            }
            if gone.contains(id) {
                unreachable.push(id.clone());
                continue;
            }
            messages.entry(id.clone()).or_default().push(message.clone());
        }
        Ok(unreachable)
    }
}

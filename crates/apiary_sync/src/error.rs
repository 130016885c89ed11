//! Error types for the sync engine.

use thiserror::Error;

/// Errors produced by stores, messengers and the offload transport.
///
/// Protocol-level input problems (null events, empty branch names) are never
/// surfaced as errors; the server logs and ignores them instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A backing store failed to read or write.
    #[error("Store error: {0}")]
    Store(String),

    /// A message could not be delivered to a connection.
    #[error("Messenger error: {0}")]
    Messenger(String),

    /// A message or atom could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A single item exceeds the store's per-item size limit.
    #[error("Item {key} is {size} bytes which exceeds the {limit} byte limit")]
    ItemTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },

    /// An oversized payload could not be offloaded to blob storage.
    #[error("Upload failed: {0}")]
    Upload(String),

    /// A download request could not be resolved.
    #[error("Download failed: {0}")]
    Download(String),
}

/// Result alias used throughout the sync engine.
pub type Result<T> = std::result::Result<T, SyncError>;

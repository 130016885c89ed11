//! # Apiary Sync Protocol Engine
//!
//! Realtime synchronization core for causal repos. Devices watch branches,
//! exchange content-addressed atoms against them, and receive presence and
//! remote-event broadcasts about the other devices on the same branch.
//!
//! This crate provides:
//! - **Protocol types**: atoms, device connections, and the client/server message unions
//! - **Stores**: [`AtomStore`] / [`ConnectionStore`] contracts plus in-memory implementations
//! - **Messenger**: the [`Messenger`] delivery contract and a recording implementation
//! - **Transport**: size-aware offload-and-redirect delivery over a [`PushChannel`]
//! - **Server**: [`SyncServer`], the stateless protocol engine
//!
//! Used by `apiary_sync_server`, which supplies SQLite stores, blob storage and
//! the WebSocket adapter.

pub mod batch;
pub mod error;
pub mod messenger;
pub mod protocol;
pub mod server;
pub mod store;
pub mod transport;

pub use error::{Result, SyncError};
pub use messenger::{MemoryMessenger, Messenger};
pub use server::SyncServer;
pub use store::{AtomStore, ConnectionStore, MemoryAtomStore, MemoryConnectionStore};
pub use transport::{OffloadMessenger, PayloadFetcher, PayloadUploader, PushChannel, PushError};

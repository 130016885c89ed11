//! # Apiary Sync Server
//!
//! Hosts [`apiary_sync::SyncServer`] behind a WebSocket endpoint. Atoms and
//! connections live in SQLite; messages too large for a single frame are
//! offloaded to blob storage (S3-compatible, or in memory and served from
//! `/blobs`).

pub mod blob_store;
pub mod config;
pub mod db;
pub mod handlers;
pub mod push;

use apiary_sync::transport::HttpPayloadFetcher;
use apiary_sync::{OffloadMessenger, SyncServer};
use axum::{Router, routing::get};
use blob_store::{BlobStore, BlobUploader};
use db::{SharedConnection, SqliteAtomStore, SqliteConnectionStore};
use handlers::{WsState, blob_routes, ws_routes};
use push::ConnectionRegistry;
use std::sync::Arc;

/// Wire the SQLite stores, push registry and blob store into a sync server
/// and return its router.
pub fn build_router(
    conn: SharedConnection,
    blob_store: Arc<dyn BlobStore>,
    max_message_size: usize,
) -> Router {
    let registry = Arc::new(ConnectionRegistry::new());
    let connections = Arc::new(SqliteConnectionStore::new(conn.clone()));
    let atoms = Arc::new(SqliteAtomStore::new(conn));
    let uploader = Arc::new(BlobUploader::new(blob_store.clone()));
    let messenger = Arc::new(
        OffloadMessenger::new(registry.clone(), uploader).with_max_message_size(max_message_size),
    );
    let server = Arc::new(SyncServer::new(connections, atoms, messenger));

    let ws_state = WsState {
        server,
        registry,
        fetcher: Arc::new(HttpPayloadFetcher::new()),
    };

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .merge(ws_routes(ws_state))
        .merge(blob_routes(blob_store))
}

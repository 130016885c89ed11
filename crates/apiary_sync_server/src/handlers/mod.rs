pub mod blobs;
pub mod ws;

pub use blobs::blob_routes;
pub use ws::{WsState, ws_routes};

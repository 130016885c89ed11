use crate::blob_store::BlobStore;
use axum::{
    Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use tracing::error;

/// Routes serving offloaded message payloads.
pub fn blob_routes(store: Arc<dyn BlobStore>) -> Router {
    Router::new()
        .route("/blobs/{*key}", get(get_blob))
        .with_state(store)
}

async fn get_blob(State(store): State<Arc<dyn BlobStore>>, Path(key): Path<String>) -> Response {
    match store.get(&key).await {
        Ok(Some(bytes)) => ([(header::CONTENT_TYPE, "application/json")], bytes).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Failed to read blob {}: {}", key, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

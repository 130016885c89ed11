use crate::push::ConnectionRegistry;
use apiary_sync::protocol::{ClientMessage, DeviceConnection};
use apiary_sync::transport::{PayloadFetcher, open_envelope};
use apiary_sync::{SyncError, SyncServer};
use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Query parameters for WebSocket connection
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    /// Session ID of the device (defaults to the connection ID)
    pub session_id: Option<String>,
    /// Username of the device (defaults to the connection ID)
    pub username: Option<String>,
    /// Opaque token stored with the connection
    pub token: Option<String>,
}

/// Shared state for WebSocket handler
#[derive(Clone)]
pub struct WsState {
    pub server: Arc<SyncServer>,
    pub registry: Arc<ConnectionRegistry>,
    pub fetcher: Arc<dyn PayloadFetcher>,
}

pub fn ws_routes(state: WsState) -> Router {
    Router::new()
        .route("/websocket", get(ws_handler))
        .with_state(state)
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

fn device_connection(connection_id: String, query: WsQuery) -> DeviceConnection {
    let or_id = |value: Option<String>| {
        value
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| connection_id.clone())
    };
    DeviceConnection {
        session_id: or_id(query.session_id),
        username: or_id(query.username),
        token: query.token.unwrap_or_default(),
        connection_id,
    }
}

/// Decode one inbound frame and run it through the sync server.
async fn handle_frame(state: &WsState, connection_id: &str, frame: &str) -> Result<(), SyncError> {
    let data = open_envelope(frame, state.fetcher.as_ref()).await?;
    let message: ClientMessage = serde_json::from_str(&data)?;
    debug!("[{}] Received {}", connection_id, message.name());
    state.server.handle_message(connection_id, message).await
}

fn error_frame(err: &SyncError) -> String {
    serde_json::json!({ "type": "error", "message": err.to_string() }).to_string()
}

async fn handle_socket(socket: WebSocket, state: WsState, query: WsQuery) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let connection = device_connection(connection_id.clone(), query);
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut outbound = state.registry.register(&connection_id);
    if let Err(e) = state.server.connect(&connection).await {
        error!("Failed to register connection {}: {}", connection_id, e);
        state.registry.unregister(&connection_id);
        return;
    }

    info!(
        "WebSocket connected: connection={}, session={}, username={}, live={}",
        connection_id,
        connection.session_id,
        connection.username,
        state.registry.len()
    );

    loop {
        tokio::select! {
            Some(msg) = ws_rx.next() => {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Err(e) = handle_frame(&state, &connection_id, text.as_str()).await {
                            warn!("[{}] Failed to handle frame: {}", connection_id, e);
                            if let Err(e) = ws_tx.send(Message::Text(error_frame(&e).into())).await {
                                error!("Failed to send error frame: {}", e);
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Client requested close");
                        break;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            Some(frame) = outbound.recv() => {
                if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                    error!("Failed to push frame: {}", e);
                    break;
                }
            }

            else => break,
        }
    }

    // Unregister after disconnect so racing broadcasts never find this connection gone.
    if let Err(e) = state.server.disconnect(&connection_id).await {
        error!("Failed to disconnect {}: {}", connection_id, e);
    }
    state.registry.unregister(&connection_id);
    info!("WebSocket disconnected: connection={}", connection_id);
}

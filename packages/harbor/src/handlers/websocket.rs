use axum::{extract::State, extract::WebSocketUpgrade, response::Response};
use tracing::warn;

use crate::app::AppState;

/// Upgrade to the event socket.
///
/// Oversized inbound messages are refused by the transport itself, which
/// ends that connection.
pub async fn socket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max = state.config.websocket.max_message_bytes;
    let registry = state.connections.clone();

    ws.max_message_size(max)
        .max_frame_size(max)
        .on_failed_upgrade(|e| warn!("WebSocket upgrade failed: {}", e))
        .on_upgrade(move |socket| async move { registry.accept(socket).await })
}

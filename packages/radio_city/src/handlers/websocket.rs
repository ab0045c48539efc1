use axum::{
    Json,
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::ws;

/// Listener WebSocket - chat, presence and keepalive for one client
pub async fn listener_websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let gateway = state.gateway.clone();
    let metrics = state.metrics.clone();
    ws.on_upgrade(move |socket| ws::handle_listener_ws(socket, gateway, metrics))
}

/// Current presence snapshot, the same payload `listeners` broadcasts carry
pub async fn listeners_handler(State(state): State<AppState>) -> Response {
    match state.gateway.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

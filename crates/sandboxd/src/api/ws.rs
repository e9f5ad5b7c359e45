use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;

use super::AppState;

/// GET /ws
///
/// Upgrades the request and hands the socket to the connection manager.
pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let connections = state.connections.clone();
    ws.on_upgrade(move |socket| connections.handle_connection(socket))
}

//! WebSocket Handler
//!
//! Boundary acceptor: checks the request origin, upgrades the HTTP
//! connection and hands the socket to the connection pumps.

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::connection::serve;
use super::origin::origin_allowed;
use crate::api::AppState;

/// WebSocket upgrade handler
///
/// Rejects the upgrade with 403 when the origin is not allowed.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    // A non-UTF-8 origin is treated as unparsable
    let origin = headers
        .get(header::ORIGIN)
        .map(|value| value.to_str().unwrap_or_default());

    let config = Arc::clone(state.hub.config());
    if !origin_allowed(origin, &config.allowed_origins) {
        tracing::warn!(origin = ?origin, "Rejected WebSocket upgrade from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    let hub = state.hub.clone();
    ws.max_message_size(config.max_message_size)
        .on_failed_upgrade(|e| tracing::error!(error = %e, "Failed to upgrade connection"))
        .on_upgrade(move |socket| serve(socket, hub))
}

//! Health Routes
//!
//! - GET /health - Hub status with connection counts

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::api::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
    pub authenticated: usize,
    pub subscribers: usize,
    pub uptime_seconds: u64,
    pub version: String,
}

/// GET /health
///
/// Answers 503 once the hub loop has stopped.
pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<Json<HealthResponse>> {
    let stats = state.hub.stats().await?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        connections: stats.connections,
        authenticated: stats.authenticated,
        subscribers: stats.subscribers,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

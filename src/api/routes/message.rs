//! Message Routes
//!
//! - POST /message - Broadcast an envelope to every connection
//! - POST /message?to=<username> - Deliver an envelope to one user's connections

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::websocket::{MailMessage, Message};

/// Query parameters for publishing
#[derive(Debug, Default, Deserialize)]
pub struct PublishParams {
    /// Recipient username; broadcast when absent or empty
    pub to: Option<String>,
}

/// Publish acknowledgement
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub status: String,
    pub delivery: String,
}

/// POST /message
///
/// Queues the envelope on the hub and returns without waiting for delivery.
pub async fn publish(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PublishParams>,
    payload: Result<Json<Message>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<PublishResponse>)> {
    let Json(message) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;

    let delivery = match params.to.filter(|to| !to.is_empty()) {
        Some(username) => {
            tracing::debug!(username = %username, topic = %message.topic, "Publishing to mailbox");
            state.hub.mailbox(MailMessage::new(username, message)).await?;
            "mailbox"
        }
        None => {
            tracing::debug!(topic = %message.topic, "Publishing broadcast");
            state.hub.broadcast(message).await?;
            "broadcast"
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            status: "queued".to_string(),
            delivery: delivery.to_string(),
        }),
    ))
}

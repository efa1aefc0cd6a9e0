//! wshub HTTP API
//!
//! HTTP layer for the hub, built with Axum.
//!
//! # Endpoints
//!
//! ## Publish
//! - `POST /message` - Broadcast a `{"data", "topic"}` envelope
//! - `POST /message?to=<username>` - Deliver an envelope to one user's mailbox
//!
//! ## Health
//! - `GET /health` - Hub status with connection counts
//!
//! ## WebSocket
//! - `GET /ws` - Subscriber connection
//!
//! # Example
//!
//! ```rust,ignore
//! use wshub::api::{serve, AppState};
//! use wshub::config::Config;
//! use wshub::websocket::Hub;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let hub = Hub::spawn(config.hub.clone(), config.auth.tokenizer());
//!
//!     let addr = config.server.addr();
//!     serve(AppState::new(hub, config), &addr).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::websocket::websocket_handler;

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/message", post(routes::message::publish))
        .route("/health", get(routes::health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(shared_state)
}

/// Start the API server
pub async fn serve(state: AppState, addr: &str) -> Result<(), ApiError> {
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("wshub listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("wshub shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

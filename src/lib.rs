//! # wshub
//!
//! WebSocket publish/subscribe hub. Publishers hand JSON envelopes to the hub
//! over HTTP; the hub fans them out to every connected client or to the
//! connections of one authenticated user.
//!
//! ## Features
//!
//! - **Broadcast and mailbox delivery**: `{"data", "topic"}` envelopes
//! - **Token authentication**: HMAC-SHA256/512 tokens per username
//! - **Keepalive**: ping/pong with read and write deadlines
//! - **Single-owner state**: one control loop owns all connection state
//!
//! ## Modules
//!
//! - [`websocket`]: Hub, connection pumps and tokenizers
//! - [`api`]: HTTP server with Axum
//! - [`config`]: TOML and environment configuration
//! - [`logging`]: `tracing` subscriber setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wshub::websocket::{Hub, HubConfig, HmacSha256Tokenizer, Message, Tokenizer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tokenizer: Arc<dyn Tokenizer> = Arc::new(HmacSha256Tokenizer::new("secret-hash-code"));
//!     let hub = Hub::spawn(HubConfig::default(), Some(tokenizer));
//!
//!     hub.broadcast(Message::new("news", serde_json::json!({"headline": "hi"})))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod logging;
pub mod websocket;

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{AuthConfig, Config, ConfigError, LoggingConfig, ServerConfig};

pub use websocket::{
    Hub, HubConfig, HubError, HubHandle, HubStats, MailMessage, Message, SlowConsumerPolicy,
    Tokenizer, TokenizerKind,
};

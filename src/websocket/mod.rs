//! WebSocket Publish/Subscribe Hub
//!
//! Fans published messages out to connected WebSocket clients, either to
//! everyone (broadcast) or to the connections of one authenticated user
//! (mailbox).
//!
//! ## Architecture
//!
//! - **Hub**: single control loop that owns all connection and subscriber
//!   state
//! - **Connection**: per-socket read and write pumps with keepalive
//! - **Tokenizer**: keyed digest used to verify subscription tokens
//! - **Handler**: origin check and WebSocket upgrade
//!
//! ## Usage
//!
//! Clients connect to `/ws` and authenticate by sending a subscription
//! frame. No reply is sent unless subscription acknowledgements are enabled.
//!
//! ```javascript
//! // Browser
//! const ws = new WebSocket('ws://localhost:8000/ws');
//!
//! ws.onopen = () => {
//!   ws.send(JSON.stringify({Username: 'mario', Token: '31a3d133...'}));
//! };
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data); // {data: ..., topic: "..."}
//!   console.log('Received:', msg);
//! };
//! ```

mod connection;
mod error;
mod handler;
mod hub;
mod messages;
mod origin;
mod token;

pub use connection::{serve, Closer, Connection, ConnectionId, Outbound, Outgoing};
pub use error::{ConnectionError, HubError};
pub use handler::websocket_handler;
pub use hub::{Hub, HubConfig, HubHandle, HubStats, SlowConsumerPolicy};
pub use messages::{
    subscription_ack, MailMessage, Message, Subscription, SubscriptionFrame,
    SUBSCRIPTION_ACK_TOPIC,
};
pub use origin::origin_allowed;
pub use token::{verify, HmacSha256Tokenizer, HmacSha512Tokenizer, Tokenizer, TokenizerKind};

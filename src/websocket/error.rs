//! Hub error types

use thiserror::Error;

/// Errors returned to callers of a [`HubHandle`](super::HubHandle)
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// The control loop has exited and accepts no more events
    #[error("Hub is not running")]
    Stopped,
}

/// Why a connection stopped pumping frames
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no frame received within the read deadline")]
    ReadTimeout,

    #[error("write did not complete within the write deadline")]
    WriteTimeout,

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("hub is not running")]
    HubStopped,

    #[error("connection closed")]
    Closed,

    /// Outbound buffer full under the drop policy
    #[error("outbound buffer is full")]
    Backlogged,
}

//! Error types for the match client.
//!
//! These cover the transport and I/O seams only. Protocol-level rejections
//! (insufficient coins, queue conflicts, illegal moves) are never errors:
//! the session state machine records them as user-facing messages.

use thiserror::Error;

/// Errors that can occur when talking to the match server or its HTTP backend.
#[derive(Debug, Error)]
pub enum MatchError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires an active connection, but the client is not connected.
    #[error("not connected to server")]
    NotConnected,

    /// Every connection attempt in the reconnection budget failed.
    #[error("connection failed after {attempts} attempt(s): {reason}")]
    ConnectionFailed {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Reason reported by the last failed attempt.
        reason: String,
    },

    /// An HTTP request to the profile/score backend failed.
    #[error("http error: {0}")]
    Http(String),

    /// A configured URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The launch-context fragment could not be decoded.
    #[error("invalid launch context: {0}")]
    LaunchContext(String),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for match client operations.
pub type Result<T> = std::result::Result<T, MatchError>;

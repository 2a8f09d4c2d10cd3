//! Transport abstraction for the match protocol.
//!
//! The [`Transport`] trait is a bidirectional text message channel between
//! the client and the match server. Every frame is one JSON document, so
//! implementations handle framing internally (WebSocket frames,
//! length-prefixed TCP, in-memory channels in tests).
//!
//! Because the connection manager re-dials after a drop, it does not take a
//! transport directly: it takes a [`Connector`], which produces a fresh
//! connected transport on every call.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use rps_match_client::error::MatchError;
//! use rps_match_client::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), MatchError> {
//!         unimplemented!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, MatchError>> {
//!         // Return None when the server closes the connection cleanly
//!         unimplemented!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), MatchError> {
//!         unimplemented!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     type Transport = MyTransport;
//!
//!     async fn connect(&mut self) -> Result<MyTransport, MatchError> {
//!         unimplemented!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::MatchError;

/// A bidirectional text message transport for the match protocol.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data. Channel-based implementations (e.g., wrapping
/// `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::TransportSend`] if the message could not be sent.
    async fn send(&mut self, message: String) -> Result<(), MatchError>;

    /// Receive the next JSON text message from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed cleanly by the server
    async fn recv(&mut self) -> Option<Result<String, MatchError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), MatchError>;
}

/// Dials the match server, producing one connected [`Transport`] per call.
#[async_trait]
pub trait Connector: Send + 'static {
    /// The transport this connector produces.
    type Transport: Transport;

    /// Establish a new connection.
    ///
    /// # Errors
    ///
    /// Any error is treated as a failed attempt and counted against the
    /// reconnection budget.
    async fn connect(&mut self) -> Result<Self::Transport, MatchError>;
}

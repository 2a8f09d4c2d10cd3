//! Built-in transports, one per Cargo feature.
//!
//! | Feature                | Provides                                       |
//! |------------------------|------------------------------------------------|
//! | `transport-websocket`  | [`WebSocketTransport`], [`WebSocketConnector`] |
//!
//! Other backends plug in by implementing [`Transport`](crate::Transport) and
//! [`Connector`](crate::Connector).

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};

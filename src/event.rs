//! Events surfaced by the connection manager.
//!
//! [`MatchEvent`] carries connection lifecycle transitions alongside every
//! decoded [`ServerEvent`], in the order they happened on the wire.

use crate::protocol::ServerEvent;

/// Who tore a connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOrigin {
    /// The local client asked to disconnect. No automatic reconnection follows.
    Client,
    /// The server closed the connection cleanly. An immediate reconnection attempt follows.
    Server,
    /// The transport failed. Reconnection follows with the configured backoff.
    Transport,
}

/// An event produced by [`MatchClient`](crate::MatchClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchEvent {
    /// A connection to the match server was established.
    Connected,
    /// A connection attempt failed.
    ///
    /// `will_retry` is `false` once the reconnection budget is exhausted; the
    /// client then stays disconnected until [`MatchClient::reconnect`](crate::MatchClient::reconnect)
    /// is called.
    ConnectionFailed { reason: String, will_retry: bool },
    /// An established connection was lost or closed.
    Disconnected {
        reason: Option<String>,
        origin: DisconnectOrigin,
    },
    /// A protocol event from the server.
    Server(ServerEvent),
}

impl From<ServerEvent> for MatchEvent {
    fn from(event: ServerEvent) -> Self {
        MatchEvent::Server(event)
    }
}

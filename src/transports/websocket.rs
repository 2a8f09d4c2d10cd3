//! WebSocket transport over `tokio-tungstenite`.
//!
//! [`WebSocketConnector`] is what [`MatchClient::connect`](crate::MatchClient::connect)
//! uses: it dials a fresh [`WebSocketTransport`] for the first connection and
//! for every reconnection attempt, each bounded by a connect timeout.
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), rps_match_client::MatchError> {
//! use std::time::Duration;
//! use rps_match_client::{Connector, Transport, WebSocketConnector};
//!
//! let mut connector = WebSocketConnector::new("ws://localhost:3000/ws")
//!     .with_timeout(Duration::from_secs(5));
//! let mut transport = connector.connect().await?;
//! if let Some(Ok(frame)) = transport.recv().await {
//!     println!("first frame: {frame}");
//! }
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tracing::{debug, info, warn};

use crate::error::MatchError;
use crate::transport::{Connector, Transport};

/// Default per-attempt connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The stream type produced by `connect_async`.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// One WebSocket connection carrying JSON text frames.
///
/// [`recv`](Transport::recv) is cancel-safe, so the connection loop can poll
/// it inside `tokio::select!` without losing frames.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Open a `ws://` or `wss://` connection.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::Io`] if the URL is invalid or the handshake
    /// fails. I/O error kinds are preserved.
    pub async fn connect(url: &str) -> Result<Self, MatchError> {
        debug!(%url, "dialing match server");
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(handshake_error)?;
        info!(%url, "websocket open");
        Ok(Self::from_stream(stream))
    }

    /// Wrap a stream that was set up elsewhere (custom TLS, headers, proxies).
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

fn handshake_error(e: tungstenite::Error) -> MatchError {
    let kind = match &e {
        tungstenite::Error::Io(io) => io.kind(),
        _ => std::io::ErrorKind::Other,
    };
    MatchError::Io(std::io::Error::new(kind, e))
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), MatchError> {
        if self.closed {
            return Err(MatchError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| MatchError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, MatchError>> {
        while let Some(next) = self.stream.next().await {
            match next {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "server sent close frame");
                    return None;
                }
                // tungstenite answers pings itself.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Binary(bytes)) => {
                    warn!(len = bytes.len(), "dropping binary frame; protocol is text only");
                }
                Err(e) => return Some(Err(MatchError::TransportReceive(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), MatchError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.stream
            .close(None)
            .await
            .map_err(|e| MatchError::TransportSend(e.to_string()))
    }
}

/// Dials `url` once per [`connect`](Connector::connect) call.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bound each attempt by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    /// # Errors
    ///
    /// Returns [`MatchError::Timeout`] when the attempt exceeds the timeout,
    /// otherwise whatever [`WebSocketTransport::connect`] returns.
    async fn connect(&mut self) -> Result<WebSocketTransport, MatchError> {
        tokio::time::timeout(self.timeout, WebSocketTransport::connect(&self.url))
            .await
            .map_err(|_| MatchError::Timeout)?
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    type ServerSide = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    /// Accept exactly one WebSocket client on a loopback port and hand it to `script`.
    async fn serve_once<F, Fut>(script: F) -> String
    where
        F: FnOnce(ServerSide) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            script(ws).await;
        });
        format!("ws://{addr}/ws")
    }

    async fn drain(mut ws: ServerSide) {
        while let Some(Ok(_)) = ws.next().await {}
    }

    #[test]
    fn transport_can_move_into_the_connection_task() {
        fn assert_send<T: Send + 'static>() {}
        assert_send::<WebSocketTransport>();
        assert_send::<WebSocketConnector>();
    }

    #[tokio::test]
    async fn bad_url_is_an_io_error() {
        let err = WebSocketTransport::connect("rps://nowhere").await.unwrap_err();
        assert!(matches!(err, MatchError::Io(_)));
    }

    #[tokio::test]
    async fn refused_port_keeps_io_kind() {
        let err = WebSocketTransport::connect("ws://127.0.0.1:1")
            .await
            .unwrap_err();
        let MatchError::Io(io) = err else {
            panic!("expected Io error, got {err:?}");
        };
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn text_frames_arrive_in_order_and_close_ends_stream() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::Text(
                r#"{"event":"connection_accepted","data":{"connectionId":"c1"}}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(
                r#"{"event":"waiting_for_opponent","data":{}}"#.into(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert!(transport
            .recv()
            .await
            .unwrap()
            .unwrap()
            .contains("connection_accepted"));
        assert!(transport
            .recv()
            .await
            .unwrap()
            .unwrap()
            .contains("waiting_for_opponent"));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn binary_frames_are_dropped() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
            ws.send(Message::Text("text".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "text");
    }

    #[tokio::test]
    async fn commands_reach_the_server_as_text() {
        let (tx, rx) = tokio::sync::oneshot::channel::<String>();
        let url = serve_once(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = tx.send(text.to_string());
            }
            drain(ws).await;
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport
            .send(r#"{"event":"cancel_matchmaking"}"#.to_string())
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), r#"{"event":"cancel_matchmaking"}"#);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn closed_transport_rejects_sends_and_closes_twice() {
        let url = serve_once(drain).await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("late".into()).await.unwrap_err();
        assert!(matches!(err, MatchError::TransportClosed));
    }

    #[tokio::test]
    async fn connector_dials_fresh_each_attempt() {
        let url = serve_once(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let mut connector =
            WebSocketConnector::new(url.clone()).with_timeout(Duration::from_secs(2));
        assert_eq!(connector.url(), url);

        let mut first = connector.connect().await.unwrap();
        assert!(first.recv().await.is_none());

        // The loopback server only accepts once.
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn connector_times_out_on_stalled_handshake() {
        // The kernel completes the TCP handshake from the backlog, but nobody
        // ever answers the upgrade request.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let mut connector = WebSocketConnector::new(format!("ws://{addr}/ws"))
            .with_timeout(Duration::from_millis(100));
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, MatchError::Timeout), "got {err:?}");
        drop(silent);
    }
}

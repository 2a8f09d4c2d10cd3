//! Connection manager for the match server.
//!
//! [`MatchClient`] owns exactly one logical connection. A background loop
//! task dials through a [`Connector`], multiplexes outgoing commands and
//! incoming frames with `tokio::select!`, and re-dials on loss:
//!
//! - a server-initiated close triggers an immediate reconnection attempt;
//! - a transport failure retries after `reconnection_delay`;
//! - a client-initiated [`disconnect`](MatchClient::disconnect) never reconnects.
//!
//! Failed attempts are bounded by `reconnection_attempts`. Exhaustion is
//! reported as [`MatchEvent::ConnectionFailed`] with `will_retry: false`
//! and the loop parks until [`reconnect`](MatchClient::reconnect) is called.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = MatchConfig::new("ws://localhost:3000/ws");
//! let (client, mut events) = MatchClient::connect(config);
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         MatchEvent::Connected => client.emit(ClientCommand::Start {
//!             username: "alice".into(),
//!             user_id: Some(42),
//!             group_owner: None,
//!         })?,
//!         MatchEvent::Server(ServerEvent::MatchFound { session_id, .. }) => { /* … */ }
//!         _ => {}
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{MatchError, Result};
use crate::event::{DisconnectOrigin, MatchEvent};
use crate::protocol::{ClientCommand, ServerEvent};
use crate::session::CommandSink;
use crate::transport::{Connector, Transport};

/// Server URL used when neither the caller nor the environment supplies one.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3000/ws";

/// Environment variable read by [`MatchConfig::from_env`].
pub const SERVER_URL_ENV: &str = "RPS_SERVER_URL";

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of retries after the first failed dial.
const DEFAULT_RECONNECTION_ATTEMPTS: u32 = 5;

/// Default delay between retries.
const DEFAULT_RECONNECTION_DELAY: Duration = Duration::from_secs(3);

/// Default per-attempt connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`MatchClient`] connection.
///
/// # Example
///
/// ```
/// use rps_match_client::client::MatchConfig;
/// use std::time::Duration;
///
/// let config = MatchConfig::new("ws://localhost:3000/ws")
///     .with_reconnection_attempts(3)
///     .with_reconnection_delay(Duration::from_millis(500));
/// assert_eq!(config.reconnection_attempts, 3);
/// ```
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// WebSocket URL of the match server.
    pub server_url: String,
    /// Retries allowed after the first failed dial before giving up.
    ///
    /// Defaults to **5**.
    pub reconnection_attempts: u32,
    /// Delay before each retry.
    ///
    /// Defaults to **3 seconds**. A server-initiated close skips the delay
    /// for the first retry.
    pub reconnection_delay: Duration,
    /// Timeout applied to each dial by the built-in WebSocket connector.
    ///
    /// Defaults to **10 seconds**.
    pub connect_timeout: Duration,
    /// Capacity of the bounded event channel.
    ///
    /// Events are never dropped: when the consumer falls behind, the
    /// connection loop waits. Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Timeout for the graceful shutdown performed by [`MatchClient::disconnect`].
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl MatchConfig {
    /// Create a new configuration for `server_url` with default values.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            reconnection_attempts: DEFAULT_RECONNECTION_ATTEMPTS,
            reconnection_delay: DEFAULT_RECONNECTION_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Create a configuration from `RPS_SERVER_URL`, falling back to
    /// [`DEFAULT_SERVER_URL`].
    pub fn from_env() -> Self {
        let url = std::env::var(SERVER_URL_ENV)
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        Self::new(url)
    }

    /// Set the number of retries after the first failed dial.
    #[must_use]
    pub fn with_reconnection_attempts(mut self, attempts: u32) -> Self {
        self.reconnection_attempts = attempts;
        self
    }

    /// Set the delay before each retry.
    #[must_use]
    pub fn with_reconnection_delay(mut self, delay: Duration) -> Self {
        self.reconnection_delay = delay;
        self
    }

    /// Set the per-attempt connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the capacity of the bounded event channel. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ── Shared state ────────────────────────────────────────────────────

/// State shared between the handles and the connection loop.
#[derive(Debug)]
struct ConnectionState {
    connected: AtomicBool,
    exhausted: AtomicBool,
    connection_id: RwLock<Option<String>>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            connection_id: RwLock::new(None),
        }
    }

    fn set_connection_id(&self, id: Option<String>) {
        if let Ok(mut slot) = self.connection_id.write() {
            *slot = id;
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.set_connection_id(None);
    }
}

/// Requests from the handles to the connection loop.
#[derive(Debug)]
enum Command {
    Emit(ClientCommand),
    Reconnect,
}

// ── Handle ──────────────────────────────────────────────────────────

/// Cloneable command handle onto a running [`MatchClient`].
///
/// The session state machine holds one of these as its [`CommandSink`].
#[derive(Debug, Clone)]
pub struct MatchHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: Arc<ConnectionState>,
}

impl MatchHandle {
    /// Returns `true` while a connection is established.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    /// Returns `true` after the reconnection budget ran out and before the
    /// next manual [`reconnect`](Self::reconnect).
    pub fn has_given_up(&self) -> bool {
        self.state.exhausted.load(Ordering::Acquire)
    }

    /// Connection id assigned by the server for the current connection.
    pub fn connection_id(&self) -> Option<String> {
        self.state
            .connection_id
            .read()
            .ok()
            .and_then(|id| id.clone())
    }

    /// Queue a command for the server.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::NotConnected`] if no connection is established.
    pub fn emit(&self, command: ClientCommand) -> Result<()> {
        if !self.is_connected() {
            return Err(MatchError::NotConnected);
        }
        self.cmd_tx
            .send(Command::Emit(command))
            .map_err(|_| MatchError::NotConnected)
    }

    /// Ask the loop to dial again immediately, restarting the attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::NotConnected`] if the connection loop has exited.
    pub fn reconnect(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::Reconnect)
            .map_err(|_| MatchError::NotConnected)
    }
}

impl CommandSink for MatchHandle {
    fn is_connected(&self) -> bool {
        MatchHandle::is_connected(self)
    }

    fn connection_id(&self) -> Option<String> {
        MatchHandle::connection_id(self)
    }

    fn emit(&self, command: ClientCommand) -> Result<()> {
        MatchHandle::emit(self, command)
    }

    fn request_reconnect(&self) {
        if let Err(e) = self.reconnect() {
            debug!("reconnect request not delivered: {e}");
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Owner of the connection loop task.
///
/// Dropping the client aborts the loop; call [`disconnect`](Self::disconnect)
/// for a graceful close.
pub struct MatchClient {
    handle: MatchHandle,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl MatchClient {
    /// Start the connection loop and return the client plus its event receiver.
    ///
    /// The first dial happens immediately. Must be called from within a
    /// Tokio runtime.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start<C: Connector>(
        connector: C,
        config: MatchConfig,
    ) -> (Self, mpsc::Receiver<MatchEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<MatchEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = Arc::new(ConnectionState::new());
        let policy = RetryPolicy {
            retries: config.reconnection_attempts,
            delay: config.reconnection_delay,
        };

        let task = tokio::spawn(connection_loop(
            connector,
            cmd_rx,
            event_tx,
            Arc::clone(&state),
            shutdown_rx,
            policy,
        ));

        let client = Self {
            handle: MatchHandle { cmd_tx, state },
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };

        (client, event_rx)
    }

    /// Start a client that dials `config.server_url` over WebSocket.
    #[cfg(feature = "transport-websocket")]
    #[must_use = "the event receiver must be used to receive events"]
    pub fn connect(config: MatchConfig) -> (Self, mpsc::Receiver<MatchEvent>) {
        let connector = crate::transports::WebSocketConnector::new(config.server_url.clone())
            .with_timeout(config.connect_timeout);
        Self::start(connector, config)
    }

    /// A cloneable command handle for this connection.
    pub fn handle(&self) -> MatchHandle {
        self.handle.clone()
    }

    /// Queue a command for the server.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::NotConnected`] if no connection is established.
    pub fn emit(&self, command: ClientCommand) -> Result<()> {
        self.handle.emit(command)
    }

    /// Dial again immediately, restarting the attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::NotConnected`] if the connection loop has exited.
    pub fn reconnect(&self) -> Result<()> {
        self.handle.reconnect()
    }

    /// Returns `true` while a connection is established.
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Connection id assigned by the server for the current connection.
    pub fn connection_id(&self) -> Option<String> {
        self.handle.connection_id()
    }

    /// Close the connection and stop the loop. No reconnection follows.
    ///
    /// Releases the transport and any pending reconnection attempt. Safe to
    /// call more than once.
    pub async fn disconnect(&mut self) {
        debug!("MatchClient: disconnect requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // Await the loop with a timeout; abort it if it doesn't exit in time.
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("connection loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("connection loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("connection loop aborted: {join_err}");
                    }
                }
            }
        }

        self.handle.state.mark_disconnected();
    }
}

impl std::fmt::Debug for MatchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchClient")
            .field("connected", &self.is_connected())
            .field("connection_id", &self.connection_id())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for MatchClient {
    fn drop(&mut self) {
        // No executor context for an async close here; aborting drops the
        // loop future, which drops the transport.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Connection loop ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    retries: u32,
    delay: Duration,
}

enum Dial<T> {
    Connected(T),
    Exhausted,
    Stop,
}

enum LinkExit {
    Stop,
    ServerClosed,
    TransportFailed,
}

/// Background loop: dial, run the link, re-dial, until shut down.
async fn connection_loop<C: Connector>(
    mut connector: C,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<MatchEvent>,
    state: Arc<ConnectionState>,
    mut shutdown_rx: oneshot::Receiver<()>,
    policy: RetryPolicy,
) {
    debug!("connection loop started");
    let mut immediate = true;

    loop {
        let dial = dial_with_retries(
            &mut connector,
            &mut cmd_rx,
            &mut shutdown_rx,
            &event_tx,
            &state,
            policy,
            immediate,
        )
        .await;

        let transport = match dial {
            Dial::Connected(transport) => transport,
            Dial::Exhausted => {
                if wait_for_manual_retry(&mut cmd_rx, &mut shutdown_rx).await {
                    immediate = true;
                    continue;
                }
                break;
            }
            Dial::Stop => break,
        };

        state.exhausted.store(false, Ordering::Release);
        state.connected.store(true, Ordering::Release);
        info!("connected to match server");
        emit_event(&event_tx, MatchEvent::Connected).await;

        match run_link(transport, &mut cmd_rx, &mut shutdown_rx, &event_tx, &state).await {
            LinkExit::Stop => break,
            LinkExit::ServerClosed => immediate = true,
            LinkExit::TransportFailed => immediate = false,
        }
    }

    state.mark_disconnected();
    debug!("connection loop exited");
}

/// Dial until connected, the budget is spent, or shutdown is requested.
async fn dial_with_retries<C: Connector>(
    connector: &mut C,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    shutdown_rx: &mut oneshot::Receiver<()>,
    event_tx: &mpsc::Sender<MatchEvent>,
    state: &ConnectionState,
    policy: RetryPolicy,
    immediate: bool,
) -> Dial<C::Transport> {
    let budget = policy.retries.saturating_add(1);
    let mut attempt: u32 = 0;

    loop {
        if (attempt > 0 || !immediate) && !backoff(policy.delay, cmd_rx, shutdown_rx).await {
            return Dial::Stop;
        }

        attempt += 1;
        debug!(attempt, budget, "dialing match server");
        let result = tokio::select! {
            result = connector.connect() => result,
            _ = &mut *shutdown_rx => return Dial::Stop,
        };

        match result {
            Ok(transport) => return Dial::Connected(transport),
            Err(e) => {
                let will_retry = attempt < budget;
                warn!(attempt, will_retry, "connection attempt failed: {e}");
                if !will_retry {
                    state.exhausted.store(true, Ordering::Release);
                    let reason = MatchError::ConnectionFailed {
                        attempts: attempt,
                        reason: e.to_string(),
                    };
                    error!("{reason}");
                    emit_event(
                        event_tx,
                        MatchEvent::ConnectionFailed {
                            reason: reason.to_string(),
                            will_retry,
                        },
                    )
                    .await;
                    return Dial::Exhausted;
                }
                emit_event(
                    event_tx,
                    MatchEvent::ConnectionFailed {
                        reason: e.to_string(),
                        will_retry,
                    },
                )
                .await;
            }
        }
    }
}

/// Sleep for `delay`. Returns `false` if shutdown was requested meanwhile.
///
/// A manual reconnect request cuts the delay short.
async fn backoff(
    delay: Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            _ = &mut *shutdown_rx => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Reconnect) => return true,
                Some(Command::Emit(command)) => drop_while_offline(&command),
                None => return false,
            },
        }
    }
}

/// Park after exhaustion until a manual reconnect. Returns `false` on shutdown.
async fn wait_for_manual_retry(
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> bool {
    loop {
        tokio::select! {
            _ = &mut *shutdown_rx => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Reconnect) => {
                    debug!("manual reconnect requested");
                    return true;
                }
                Some(Command::Emit(command)) => drop_while_offline(&command),
                None => return false,
            },
        }
    }
}

fn drop_while_offline(command: &ClientCommand) {
    warn!(
        command = command.name(),
        "dropping command queued while disconnected"
    );
}

/// Pump one established connection until it ends.
async fn run_link<T: Transport>(
    mut transport: T,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    shutdown_rx: &mut oneshot::Receiver<()>,
    event_tx: &mpsc::Sender<MatchEvent>,
    state: &ConnectionState,
) -> LinkExit {
    loop {
        tokio::select! {
            // Branch 1: outgoing command from a handle
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Emit(command)) => {
                        debug!(command = command.name(), "sending client command");
                        match serde_json::to_string(&command) {
                            Ok(json) => {
                                if let Err(e) = transport.send(json).await {
                                    error!("transport send error: {e}");
                                    state.mark_disconnected();
                                    emit_event(event_tx, MatchEvent::Disconnected {
                                        reason: Some(format!("transport send error: {e}")),
                                        origin: DisconnectOrigin::Transport,
                                    }).await;
                                    return LinkExit::TransportFailed;
                                }
                            }
                            Err(e) => {
                                // Serialization errors are programming bugs; don't kill the link.
                                error!("failed to serialize ClientCommand: {e}");
                            }
                        }
                    }
                    Some(Command::Reconnect) => {
                        debug!("reconnect requested while connected; ignoring");
                    }
                    // Every handle dropped.
                    None => {
                        debug!("command channel closed, closing connection");
                        close_by_client(&mut transport, event_tx, state).await;
                        return LinkExit::Stop;
                    }
                }
            }

            // Branch 2: shutdown signal
            _ = &mut *shutdown_rx => {
                debug!("shutdown signal received");
                close_by_client(&mut transport, event_tx, state).await;
                return LinkExit::Stop;
            }

            // Branch 3: incoming frame from the server
            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                update_state(state, &event);
                                emit_event(event_tx, MatchEvent::Server(event)).await;
                            }
                            Err(e) => {
                                warn!("failed to deserialize server event: {e}; raw: {text}");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        state.mark_disconnected();
                        emit_event(event_tx, MatchEvent::Disconnected {
                            reason: Some(format!("transport receive error: {e}")),
                            origin: DisconnectOrigin::Transport,
                        }).await;
                        return LinkExit::TransportFailed;
                    }
                    None => {
                        info!("connection closed by server; reconnecting");
                        state.mark_disconnected();
                        emit_event(event_tx, MatchEvent::Disconnected {
                            reason: Some("server closed the connection".into()),
                            origin: DisconnectOrigin::Server,
                        }).await;
                        return LinkExit::ServerClosed;
                    }
                }
            }
        }
    }
}

async fn close_by_client<T: Transport>(
    transport: &mut T,
    event_tx: &mpsc::Sender<MatchEvent>,
    state: &ConnectionState,
) {
    if let Err(e) = transport.close().await {
        debug!("transport close failed: {e}");
    }
    state.mark_disconnected();
    emit_event(
        event_tx,
        MatchEvent::Disconnected {
            reason: Some("client disconnected".into()),
            origin: DisconnectOrigin::Client,
        },
    )
    .await;
}

/// Update shared [`ConnectionState`] based on a received [`ServerEvent`].
fn update_state(state: &ConnectionState, event: &ServerEvent) {
    if let ServerEvent::ConnectionAccepted { connection_id } = event {
        debug!(%connection_id, "state: connection accepted");
        state.set_connection_id(Some(connection_id.clone()));
    }
}

/// Deliver an event, waiting for room in the channel.
///
/// The session state machine assumes exactly-once delivery, so events are
/// never dropped for backpressure.
async fn emit_event(event_tx: &mpsc::Sender<MatchEvent>, event: MatchEvent) {
    if event_tx.send(event).await.is_err() {
        debug!("event channel closed, receiver dropped");
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    // ── Mock transport / connector ──────────────────────────────────

    type Script = Vec<Option<std::result::Result<String, MatchError>>>;

    /// Replays scripted frames and records what was sent.
    struct MockTransport {
        incoming: VecDeque<Option<std::result::Result<String, MatchError>>>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, message: String) -> std::result::Result<(), MatchError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, MatchError>> {
            if let Some(item) = self.incoming.pop_front() {
                item
            } else {
                std::future::pending().await
            }
        }

        async fn close(&mut self) -> std::result::Result<(), MatchError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Hands out one scripted transport (or failure) per dial.
    struct MockConnector {
        dials: VecDeque<std::result::Result<Script, String>>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
        attempts: Arc<StdMutex<u32>>,
    }

    impl MockConnector {
        fn new(dials: Vec<std::result::Result<Script, String>>) -> Self {
            Self {
                dials: VecDeque::from(dials),
                sent: Arc::new(StdMutex::new(Vec::new())),
                closed: Arc::new(AtomicBool::new(false)),
                attempts: Arc::new(StdMutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Transport = MockTransport;

        async fn connect(&mut self) -> std::result::Result<MockTransport, MatchError> {
            *self.attempts.lock().unwrap() += 1;
            match self.dials.pop_front() {
                Some(Ok(script)) => Ok(MockTransport {
                    incoming: VecDeque::from(script),
                    sent: Arc::clone(&self.sent),
                    closed: Arc::clone(&self.closed),
                }),
                Some(Err(reason)) => Err(MatchError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    reason,
                ))),
                None => Err(MatchError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "no more scripted dials",
                ))),
            }
        }
    }

    fn accepted_json(id: &str) -> String {
        serde_json::to_string(&ServerEvent::ConnectionAccepted {
            connection_id: id.into(),
        })
        .unwrap()
    }

    fn fast_config() -> MatchConfig {
        MatchConfig::new("ws://unused")
            .with_reconnection_attempts(2)
            .with_reconnection_delay(Duration::from_millis(20))
            .with_shutdown_timeout(Duration::from_millis(200))
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn connected_is_first_event_and_connection_id_is_recorded() {
        let connector = MockConnector::new(vec![Ok(vec![Some(Ok(accepted_json("c-1")))])]);
        let (mut client, mut events) = MatchClient::start(connector, fast_config());

        assert_eq!(events.recv().await.unwrap(), MatchEvent::Connected);
        let ev = events.recv().await.unwrap();
        assert!(matches!(
            ev,
            MatchEvent::Server(ServerEvent::ConnectionAccepted { .. })
        ));

        assert!(client.is_connected());
        assert_eq!(client.connection_id().as_deref(), Some("c-1"));

        client.disconnect().await;
    }

    #[tokio::test]
    async fn emit_serializes_command_onto_transport() {
        let connector = MockConnector::new(vec![Ok(vec![Some(Ok(accepted_json("c-1")))])]);
        let sent = Arc::clone(&connector.sent);
        let (mut client, mut events) = MatchClient::start(connector, fast_config());

        let _ = events.recv().await; // Connected
        let _ = events.recv().await; // ConnectionAccepted

        client
            .emit(ClientCommand::MakeChoice {
                session_id: "s1".into(),
                choice: crate::protocol::Choice::Rock,
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let messages = sent.lock().unwrap();
            let last: serde_json::Value = serde_json::from_str(messages.last().unwrap()).unwrap();
            assert_eq!(last["event"], "make_choice");
            assert_eq!(last["data"]["sessionId"], "s1");
            assert_eq!(last["data"]["choice"], "rock");
        }

        client.disconnect().await;
    }

    #[tokio::test]
    async fn server_close_reconnects_immediately() {
        let connector = MockConnector::new(vec![
            Ok(vec![Some(Ok(accepted_json("c-1"))), None]),
            Ok(vec![Some(Ok(accepted_json("c-2")))]),
        ]);
        // A long delay proves the first retry after a server close skips it.
        let config = fast_config().with_reconnection_delay(Duration::from_secs(60));
        let (mut client, mut events) = MatchClient::start(connector, config);

        assert_eq!(events.recv().await.unwrap(), MatchEvent::Connected);
        let _ = events.recv().await; // c-1 accepted
        let ev = events.recv().await.unwrap();
        assert!(matches!(
            ev,
            MatchEvent::Disconnected {
                origin: DisconnectOrigin::Server,
                ..
            }
        ));

        let ev = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("reconnect should not wait for the delay")
            .unwrap();
        assert_eq!(ev, MatchEvent::Connected);
        let _ = events.recv().await; // c-2 accepted
        assert_eq!(client.connection_id().as_deref(), Some("c-2"));

        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_parks_until_manual_reconnect() {
        let connector = MockConnector::new(vec![
            Err("refused".into()),
            Err("refused".into()),
            Err("refused".into()),
            Ok(vec![Some(Ok(accepted_json("c-9")))]),
        ]);
        let attempts = Arc::clone(&connector.attempts);
        let (mut client, mut events) = MatchClient::start(connector, fast_config());

        // First dial + 2 retries.
        for expected_retry in [true, true, false] {
            match events.recv().await.unwrap() {
                MatchEvent::ConnectionFailed { will_retry, .. } => {
                    assert_eq!(will_retry, expected_retry)
                }
                other => panic!("expected ConnectionFailed, got {other:?}"),
            }
        }
        assert_eq!(*attempts.lock().unwrap(), 3);
        assert!(client.handle().has_given_up());
        assert!(!client.is_connected());

        // Parked: no further dials without a manual request.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*attempts.lock().unwrap(), 3);

        client.reconnect().unwrap();
        assert_eq!(events.recv().await.unwrap(), MatchEvent::Connected);
        assert!(!client.handle().has_given_up());

        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_reconnects_after_delay() {
        let connector = MockConnector::new(vec![
            Ok(vec![Some(Err(MatchError::TransportReceive("reset".into())))]),
            Ok(vec![]),
        ]);
        let (mut client, mut events) = MatchClient::start(connector, fast_config());

        assert_eq!(events.recv().await.unwrap(), MatchEvent::Connected);
        match events.recv().await.unwrap() {
            MatchEvent::Disconnected { reason, origin } => {
                assert_eq!(origin, DisconnectOrigin::Transport);
                assert!(reason.unwrap().contains("reset"));
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }
        assert_eq!(events.recv().await.unwrap(), MatchEvent::Connected);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_closes_transport_without_reconnecting() {
        let connector = MockConnector::new(vec![Ok(vec![]), Ok(vec![])]);
        let closed = Arc::clone(&connector.closed);
        let attempts = Arc::clone(&connector.attempts);
        let (mut client, mut events) = MatchClient::start(connector, fast_config());

        assert_eq!(events.recv().await.unwrap(), MatchEvent::Connected);
        client.disconnect().await;

        match events.recv().await.unwrap() {
            MatchEvent::Disconnected { origin, .. } => {
                assert_eq!(origin, DisconnectOrigin::Client)
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }
        assert!(events.recv().await.is_none());
        assert!(closed.load(Ordering::Relaxed));
        assert_eq!(*attempts.lock().unwrap(), 1);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn emit_while_disconnected_is_not_connected_error() {
        let connector = MockConnector::new(vec![Ok(vec![])]);
        let (mut client, mut events) = MatchClient::start(connector, fast_config());
        let _ = events.recv().await; // Connected

        client.disconnect().await;

        let result = client.emit(ClientCommand::CancelMatchmaking);
        assert!(matches!(result, Err(MatchError::NotConnected)));
    }

    #[tokio::test]
    async fn double_disconnect_does_not_panic() {
        let connector = MockConnector::new(vec![Ok(vec![])]);
        let (mut client, mut events) = MatchClient::start(connector, fast_config());
        let _ = events.recv().await; // Connected

        client.disconnect().await;
        client.disconnect().await;
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let connector = MockConnector::new(vec![Ok(vec![
            Some(Ok("not json".into())),
            Some(Ok(r#"{"event":"no_such_event","data":{}}"#.into())),
            Some(Ok(accepted_json("c-3"))),
        ])]);
        let (mut client, mut events) = MatchClient::start(connector, fast_config());

        assert_eq!(events.recv().await.unwrap(), MatchEvent::Connected);
        let ev = events.recv().await.unwrap();
        assert_eq!(
            ev,
            MatchEvent::Server(ServerEvent::ConnectionAccepted {
                connection_id: "c-3".into()
            })
        );

        client.disconnect().await;
    }

    #[test]
    fn config_defaults() {
        let config = MatchConfig::new("ws://example");
        assert_eq!(config.server_url, "ws://example");
        assert_eq!(config.reconnection_attempts, 5);
        assert_eq!(config.reconnection_delay, Duration::from_secs(3));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[test]
    fn event_channel_capacity_is_clamped_to_one() {
        let config = MatchConfig::new("ws://example").with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }
}

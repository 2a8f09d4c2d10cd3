#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for RPS match client integration tests.
//!
//! Provides a scripted [`MockTransport`], a [`MockConnector`] that hands out
//! one scripted transport per dial, a recording [`SinkProbe`] for driving a
//! [`Session`](rps_match_client::Session) directly, and helpers that build
//! server event JSON.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use rps_match_client::protocol::{
    Choice, ClientCommand, RoundResultPayload, RoundScores, ServerEvent, TimerDetails,
};
use rps_match_client::{CommandSink, Connector, MatchError, Transport};

/// One scripted server frame, or `None` for a clean server close.
pub type Frame = Option<Result<String, MatchError>>;

// ── MockTransport ───────────────────────────────────────────────────

/// Scripted server responses are consumed in order by `recv()`.
/// All messages sent by the client are recorded in `sent`.
pub struct MockTransport {
    incoming: VecDeque<Frame>,
    pub sent: Arc<StdMutex<Vec<String>>>,
    pub closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), MatchError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, MatchError>> {
        if let Some(item) = self.incoming.pop_front() {
            item
        } else {
            // No more scripted frames: hang so the link stays up until shutdown.
            std::future::pending().await
        }
    }

    async fn close(&mut self) -> Result<(), MatchError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// Outcome of one scripted dial.
pub enum Dial {
    Accept(Vec<Frame>),
    Refuse(&'static str),
}

/// Hands out one scripted transport (or refusal) per `connect()` call.
///
/// Once the script runs out every further dial is refused.
pub struct MockConnector {
    dials: VecDeque<Dial>,
    pub sent: Arc<StdMutex<Vec<String>>>,
    pub closed: Arc<AtomicBool>,
    pub attempts: Arc<AtomicU32>,
}

/// Shared inspection handles of a [`MockConnector`].
#[derive(Clone)]
pub struct Probe {
    pub sent: Arc<StdMutex<Vec<String>>>,
    pub closed: Arc<AtomicBool>,
    pub attempts: Arc<AtomicU32>,
}

impl Probe {
    /// Every sent frame decoded as JSON.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    /// Event names of every sent frame.
    pub fn sent_events(&self) -> Vec<String> {
        self.sent_json()
            .iter()
            .map(|v| v["event"].as_str().unwrap().to_string())
            .collect()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl MockConnector {
    pub fn new(dials: Vec<Dial>) -> (Self, Probe) {
        let connector = Self {
            dials: VecDeque::from(dials),
            sent: Arc::new(StdMutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            attempts: Arc::new(AtomicU32::new(0)),
        };
        let probe = Probe {
            sent: Arc::clone(&connector.sent),
            closed: Arc::clone(&connector.closed),
            attempts: Arc::clone(&connector.attempts),
        };
        (connector, probe)
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&mut self) -> Result<MockTransport, MatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.dials.pop_front() {
            Some(Dial::Accept(frames)) => Ok(MockTransport {
                incoming: VecDeque::from(frames),
                sent: Arc::clone(&self.sent),
                closed: Arc::clone(&self.closed),
            }),
            Some(Dial::Refuse(reason)) => Err(MatchError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                reason,
            ))),
            None => Err(MatchError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "script exhausted",
            ))),
        }
    }
}

// ── SinkProbe ───────────────────────────────────────────────────────

/// Recording [`CommandSink`] with a switchable connection flag.
#[derive(Clone)]
pub struct SinkProbe {
    pub sent: Arc<StdMutex<Vec<ClientCommand>>>,
    pub connected: Arc<AtomicBool>,
    pub reconnects: Arc<AtomicU32>,
    pub connection_id: Option<String>,
}

impl SinkProbe {
    /// A connected sink whose connection id is `me`.
    pub fn connected() -> Self {
        Self {
            sent: Arc::new(StdMutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
            reconnects: Arc::new(AtomicU32::new(0)),
            connection_id: Some("me".into()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClientCommand> {
        self.sent.lock().unwrap().clone()
    }
}

impl CommandSink for SinkProbe {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_id(&self) -> Option<String> {
        self.connection_id.clone()
    }

    fn emit(&self, command: ClientCommand) -> Result<(), MatchError> {
        if !self.is_connected() {
            return Err(MatchError::NotConnected);
        }
        self.sent.lock().unwrap().push(command);
        Ok(())
    }

    fn request_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Event builders ──────────────────────────────────────────────────

pub fn match_found(session_id: &str, opponent: &str, you: &str) -> ServerEvent {
    ServerEvent::MatchFound {
        session_id: session_id.into(),
        opponent: opponent.into(),
        your_username: you.into(),
    }
}

pub fn round_result(
    mine: Option<Choice>,
    theirs: Option<Choice>,
    result: &str,
    scores: (u32, u32),
) -> ServerEvent {
    ServerEvent::RoundResult(Box::new(RoundResultPayload {
        your_choice: mine,
        opponent_choice: theirs,
        result: result.into(),
        reason: None,
        scores: RoundScores {
            current_player: scores.0,
            opponent: scores.1,
        },
    }))
}

pub fn opponent_made_choice(active_for: Option<&str>, duration_ms: u64) -> ServerEvent {
    ServerEvent::OpponentMadeChoice {
        message: "Opponent has made their choice.".into(),
        timer_details: active_for.map(|id| TimerDetails {
            active_for: id.into(),
            duration_ms,
        }),
    }
}

// ── JSON helper functions ───────────────────────────────────────────

/// Returns the JSON frame for a server event.
pub fn json(event: &ServerEvent) -> String {
    serde_json::to_string(event).expect("server event serialization")
}

/// Returns the `connection_accepted` frame for `id`.
pub fn accepted_json(id: &str) -> String {
    json(&ServerEvent::ConnectionAccepted {
        connection_id: id.into(),
    })
}

/// Scripted frame helper.
pub fn frame(text: String) -> Frame {
    Some(Ok(text))
}

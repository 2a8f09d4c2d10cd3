//! Wire types for the match protocol.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<snake_case name>", "data": { ...camelCase fields... }}`.
//! Event names and payload field names are part of the compatibility
//! surface with the match server and must not change.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ── Enums ───────────────────────────────────────────────────────────

/// A move in a round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Choice {
    Rock,
    Paper,
    Scissors,
}

impl Choice {
    /// All choices, in display order.
    pub const ALL: [Choice; 3] = [Choice::Rock, Choice::Paper, Choice::Scissors];

    /// Glyph shown for this choice.
    pub fn glyph(self) -> &'static str {
        match self {
            Choice::Rock => "✊",
            Choice::Paper => "✋",
            Choice::Scissors => "✌️",
        }
    }

    /// Wire name of this choice.
    pub fn as_str(self) -> &'static str {
        match self {
            Choice::Rock => "rock",
            Choice::Paper => "paper",
            Choice::Scissors => "scissors",
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Choice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rock" | "r" => Ok(Choice::Rock),
            "paper" | "p" => Ok(Choice::Paper),
            "scissors" | "s" => Ok(Choice::Scissors),
            other => Err(format!("unknown choice: {other}")),
        }
    }
}

/// Outcome of a round from the local player's point of view.
///
/// The server publishes outcomes as display text (`"You won!"`,
/// `"You lost!"`, `"It's a tie!"`); the client never adjudicates a round
/// itself, it only classifies the text it was given.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Win,
    Loss,
    Tie,
    #[default]
    Pending,
}

impl RoundOutcome {
    /// Classify the server's result text.
    pub fn from_server_text(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        if lower.contains("won") {
            RoundOutcome::Win
        } else if lower.contains("lost") {
            RoundOutcome::Loss
        } else if lower.contains("tie") {
            RoundOutcome::Tie
        } else {
            RoundOutcome::Pending
        }
    }
}

// ── Payload structs ─────────────────────────────────────────────────

/// Server-granted response deadline attached to `opponent_made_choice`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimerDetails {
    /// Connection id of the player who is now on the clock.
    pub active_for: String,
    /// Time the player has to respond, in milliseconds.
    #[serde(rename = "duration")]
    pub duration_ms: u64,
}

/// Running scores as reported by the server, from the recipient's side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoundScores {
    pub current_player: u32,
    pub opponent: u32,
}

/// Payload for the `round_result` server event.
/// Boxed in `ServerEvent` to reduce enum size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoundResultPayload {
    /// `None` when the local player timed out.
    pub your_choice: Option<Choice>,
    /// `None` when the opponent timed out.
    pub opponent_choice: Option<Choice>,
    /// Display text such as `"You won!"`.
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub scores: RoundScores,
}

impl RoundResultPayload {
    /// Classified outcome of this round.
    pub fn outcome(&self) -> RoundOutcome {
        RoundOutcome::from_server_text(&self.result)
    }
}

/// A participant as listed in a server session record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionPlayer {
    pub socket_id: String,
    pub username: String,
}

/// Server-side view of a session, keyed by connection id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub players: Vec<SessionPlayer>,
    #[serde(default)]
    pub scores: HashMap<String, u32>,
}

/// Payload for the `game_ended_insufficient_funds` server event.
/// Boxed in `ServerEvent` to reduce enum size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InsufficientFundsPayload {
    pub message: String,
    /// Whether the local player may start another match.
    pub can_continue: bool,
    #[serde(default)]
    pub session: SessionRecord,
}

/// Payload for the `session_resynced` server event.
/// Boxed in `ServerEvent` to reduce enum size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionResyncPayload {
    pub session_id: String,
    pub opponent: String,
    pub your_username: String,
    pub scores: RoundScores,
    /// Whether the server already holds the local player's choice for the open round.
    #[serde(default)]
    pub has_chosen: bool,
}

// ── Messages ────────────────────────────────────────────────────────

/// Commands sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    /// Enter the matchmaking queue.
    Start {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_owner: Option<String>,
    },
    /// Lock in a move for the open round.
    MakeChoice { session_id: String, choice: Choice },
    /// Cosmetic reaction shown to the opponent.
    MakeReaction { session_id: String, reaction: String },
    /// Leave the matchmaking queue.
    CancelMatchmaking,
    /// End the current session.
    EndGame { session_id: String },
    /// Ask the server to re-send session state after a reconnect.
    Resync { session_id: String },
}

/// Events sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// First frame on every connection; carries the local connection id.
    ConnectionAccepted { connection_id: String },
    MatchFound {
        session_id: String,
        opponent: String,
        your_username: String,
    },
    WaitingForOpponent {
        #[serde(default)]
        message: String,
    },
    AlreadyInQueue {
        #[serde(default)]
        message: String,
    },
    AlreadyInSession {
        #[serde(default)]
        message: String,
    },
    MatchmakingCancelled {
        #[serde(default)]
        message: String,
    },
    NotInQueue {
        #[serde(default)]
        message: String,
    },
    CannotCancelInGame {
        #[serde(default)]
        message: String,
    },
    ChoiceRegistered {
        #[serde(default)]
        message: String,
    },
    OpponentMadeChoice {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timer_details: Option<TimerDetails>,
    },
    RoundResult(Box<RoundResultPayload>),
    OpponentDisconnected {
        #[serde(default)]
        message: String,
    },
    GameEnded {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiator: Option<String>,
    },
    GameEndedInsufficientFunds(Box<InsufficientFundsPayload>),
    ErrorOccurred {
        #[serde(default)]
        message: String,
    },
    MatchmakingFailedInsufficientCoins {
        #[serde(default)]
        message: String,
        #[serde(default)]
        required: i64,
        #[serde(default)]
        current_balance: i64,
    },
    MatchmakingFailedSystemError {
        #[serde(default)]
        message: String,
    },
    OpponentForfeitCoins {
        #[serde(default)]
        message: String,
    },
    ForfeitCoins {
        #[serde(default)]
        message: String,
    },
    SessionResynced(Box<SessionResyncPayload>),
    SessionInvalid {
        #[serde(default)]
        message: String,
    },
}

impl ServerEvent {
    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionAccepted { .. } => "connection_accepted",
            ServerEvent::MatchFound { .. } => "match_found",
            ServerEvent::WaitingForOpponent { .. } => "waiting_for_opponent",
            ServerEvent::AlreadyInQueue { .. } => "already_in_queue",
            ServerEvent::AlreadyInSession { .. } => "already_in_session",
            ServerEvent::MatchmakingCancelled { .. } => "matchmaking_cancelled",
            ServerEvent::NotInQueue { .. } => "not_in_queue",
            ServerEvent::CannotCancelInGame { .. } => "cannot_cancel_in_game",
            ServerEvent::ChoiceRegistered { .. } => "choice_registered",
            ServerEvent::OpponentMadeChoice { .. } => "opponent_made_choice",
            ServerEvent::RoundResult(_) => "round_result",
            ServerEvent::OpponentDisconnected { .. } => "opponent_disconnected",
            ServerEvent::GameEnded { .. } => "game_ended",
            ServerEvent::GameEndedInsufficientFunds(_) => "game_ended_insufficient_funds",
            ServerEvent::ErrorOccurred { .. } => "error_occurred",
            ServerEvent::MatchmakingFailedInsufficientCoins { .. } => {
                "matchmaking_failed_insufficient_coins"
            }
            ServerEvent::MatchmakingFailedSystemError { .. } => "matchmaking_failed_system_error",
            ServerEvent::OpponentForfeitCoins { .. } => "opponent_forfeit_coins",
            ServerEvent::ForfeitCoins { .. } => "forfeit_coins",
            ServerEvent::SessionResynced(_) => "session_resynced",
            ServerEvent::SessionInvalid { .. } => "session_invalid",
        }
    }
}

impl ClientCommand {
    /// Wire name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Start { .. } => "start",
            ClientCommand::MakeChoice { .. } => "make_choice",
            ClientCommand::MakeReaction { .. } => "make_reaction",
            ClientCommand::CancelMatchmaking => "cancel_matchmaking",
            ClientCommand::EndGame { .. } => "end_game",
            ClientCommand::Resync { .. } => "resync",
        }
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

    #[test]
    fn outcome_classification_matches_server_text() {
        assert_eq!(RoundOutcome::from_server_text("You won!"), RoundOutcome::Win);
        assert_eq!(RoundOutcome::from_server_text("You lost!"), RoundOutcome::Loss);
        assert_eq!(RoundOutcome::from_server_text("It's a tie!"), RoundOutcome::Tie);
        assert_eq!(RoundOutcome::from_server_text(""), RoundOutcome::Pending);
    }

    #[test]
    fn choice_parses_short_and_long_forms() {
        assert_eq!("Rock".parse::<Choice>().unwrap(), Choice::Rock);
        assert_eq!("p".parse::<Choice>().unwrap(), Choice::Paper);
        assert!("lizard".parse::<Choice>().is_err());
    }

    #[test]
    fn names_match_serialized_tags() {
        let cmd = ClientCommand::EndGame {
            session_id: "s1".into(),
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["event"], cmd.name());

        let ev = ServerEvent::SessionInvalid {
            message: "gone".into(),
        };
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["event"], ev.name());
    }
}

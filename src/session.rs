//! Client-side match session state machine.
//!
//! [`Session`] consumes [`MatchEvent`]s from the connection manager and local
//! user actions, and emits [`ClientCommand`]s through a [`CommandSink`].
//!
//! ```text
//! Idle ──start──▶ Searching ──match_found──▶ OpponentFound ──delay──▶ Joining
//!   ▲                │                                                  │
//!   │      cancel / rejected                                    countdown hits 0
//!   │                ▼                                                  ▼
//!   └─────────────  Idle          Ended ◀──end / disconnect / funds── Playing ⟲ round_result
//!   └───────────────play_again──────┘
//! ```
//!
//! State is split into two layers. Authoritative round fields (choices,
//! result, scores) change only on server events. The optimistic overlay (the
//! locally submitted choice and the cosmetic coin delta) is written by local
//! actions and cleared by the next authoritative event.
//!
//! The session never performs I/O beyond emitting commands. Profile fetches,
//! coin deltas and score submissions are queued as [`SideEffect`]s for the
//! owner to drain with [`Session::take_effects`]. Local delays (the
//! opponent-found pause, the joining countdown, coin-change expiry) are
//! deadline driven: the owner sleeps until [`Session::next_deadline`] and
//! calls [`Session::advance`].

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::ScoreSubmission;
use crate::error::Result;
use crate::event::{DisconnectOrigin, MatchEvent};
use crate::protocol::{
    Choice, ClientCommand, InsufficientFundsPayload, RoundOutcome, RoundResultPayload,
    ServerEvent, SessionResyncPayload, TimerDetails,
};
use crate::timer::{TimerState, TurnTimer};

const MSG_SEARCHING: &str = "Searching for an opponent...";
const MSG_NO_USERNAME: &str = "Please enter a username or ensure it's provided via query.";
const MSG_CANNOT_CONNECT: &str = "Cannot connect to server. Please wait or check server status.";
const MSG_NOT_SEARCHING: &str = "You are not currently searching for a game.";
const MSG_NOT_CONNECTED: &str = "Not connected to server.";
const MSG_GAME_STARTED: &str = "Game started! Make your move.";
const MSG_CHOICE_LOCKED: &str = "Choice locked! Waiting for opponent...";
const MSG_REVEALING: &str = "Opponent has chosen. Revealing results...";
const MSG_NEXT_MOVE: &str = "Choose your next move!";
const MSG_CHOICE_REGISTERED: &str = "Choice registered. Waiting for opponent.";
const MSG_MATCHMAKING_CANCELLED: &str = "Matchmaking cancelled.";
const MSG_YOU_ENDED: &str = "You ended the game. Play again?";
const MSG_OPPONENT_LEFT: &str = "Opponent disconnected. The game has ended.";
const MSG_GAME_ENDED: &str = "The game has ended.";
const MSG_SESSION_GONE: &str = "The session is no longer available.";
const MSG_LOST_WHILE_SEARCHING: &str = "Connection lost while searching. Please start again.";

// ── Command sink ────────────────────────────────────────────────────

/// Where the session sends protocol commands.
///
/// Implemented by [`MatchHandle`](crate::client::MatchHandle); tests provide
/// recording fakes.
pub trait CommandSink {
    /// `true` while the underlying connection is established.
    fn is_connected(&self) -> bool;

    /// Server-assigned id of the current connection, used to recognize the
    /// local player in `activeFor` and session score maps.
    fn connection_id(&self) -> Option<String>;

    /// Queue a command for the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be queued.
    fn emit(&self, command: ClientCommand) -> Result<()>;

    /// Ask the connection manager to dial again.
    fn request_reconnect(&self);
}

// ── Phase and round types ───────────────────────────────────────────

/// Coarse lifecycle phase. Single source of truth for which actions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Searching,
    OpponentFound,
    Joining,
    Playing,
    Ended,
}

impl Phase {
    /// `true` while a server session is held and not yet ended.
    pub fn in_match(self) -> bool {
        matches!(self, Phase::OpponentFound | Phase::Joining | Phase::Playing)
    }

    fn accepts_queue_events(self) -> bool {
        matches!(self, Phase::Idle | Phase::Searching)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Searching => "searching",
            Phase::OpponentFound => "opponent_found",
            Phase::Joining => "joining",
            Phase::Playing => "playing",
            Phase::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// One side of a round as displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChoiceSlot {
    #[default]
    Unchosen,
    Chosen(Choice),
    /// The server resolved the round without a choice from this side.
    TimedOut,
}

impl ChoiceSlot {
    /// Glyph shown for this slot.
    pub fn glyph(self) -> &'static str {
        match self {
            ChoiceSlot::Unchosen => "?",
            ChoiceSlot::Chosen(choice) => choice.glyph(),
            ChoiceSlot::TimedOut => "⏳",
        }
    }

    fn resolved(choice: Option<Choice>) -> Self {
        choice.map_or(ChoiceSlot::TimedOut, ChoiceSlot::Chosen)
    }
}

/// Which profile a fetch is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileRole {
    User,
    Opponent,
}

/// Work the session wants done outside its own state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Fetch (or refresh) a profile by username. Fire-and-forget.
    FetchProfile { username: String, role: ProfileRole },
    /// Apply an optimistic coin delta to the cached local profile.
    ApplyCoinDelta(i64),
    /// Persist the final score. Best effort; failures are logged only.
    SubmitScore(ScoreSubmission),
}

/// Scores frozen at the moment a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FinalScores {
    pub player: u32,
    pub opponent: Option<u32>,
}

/// Terminal snapshot of an ended session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameEndRecord {
    pub reason: String,
    pub final_scores: FinalScores,
    /// Server-communicated eligibility to start another match.
    pub can_play_again: bool,
}

// ── Configuration ───────────────────────────────────────────────────

/// Local pacing and reward settings for a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pause between `match_found` and the joining countdown. Default 2 s.
    pub opponent_found_delay: Duration,
    /// Number of countdown steps before play starts. Default 2.
    pub joining_countdown: u32,
    /// Length of one countdown step. Default 1 s.
    pub countdown_step: Duration,
    /// Optimistic coin delta applied per won or lost round. Default 10.
    pub coin_reward: i64,
    /// How long the transient coin change stays visible. Default 2 s.
    pub coin_change_display: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            opponent_found_delay: Duration::from_secs(2),
            joining_countdown: 2,
            countdown_step: Duration::from_secs(1),
            coin_reward: 10,
            coin_change_display: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_opponent_found_delay(mut self, delay: Duration) -> Self {
        self.opponent_found_delay = delay;
        self
    }

    #[must_use]
    pub fn with_joining_countdown(mut self, steps: u32, step: Duration) -> Self {
        self.joining_countdown = steps;
        self.countdown_step = step;
        self
    }

    #[must_use]
    pub fn with_coin_reward(mut self, reward: i64) -> Self {
        self.coin_reward = reward;
        self
    }

    #[must_use]
    pub fn with_coin_change_display(mut self, display: Duration) -> Self {
        self.coin_change_display = display;
        self
    }
}

/// Identity used to enter matchmaking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartParams {
    pub username: String,
    pub user_id: Option<i64>,
    pub group_owner: Option<String>,
    /// Platform message id echoed back in score submissions.
    pub inline_message_id: Option<String>,
}

impl StartParams {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_group_owner(mut self, owner: impl Into<String>) -> Self {
        self.group_owner = Some(owner.into());
        self
    }

    #[must_use]
    pub fn with_inline_message_id(mut self, id: impl Into<String>) -> Self {
        self.inline_message_id = Some(id.into());
        self
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Owned view of everything a renderer needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub connected: bool,
    pub username: Option<String>,
    pub confirmed_username: Option<String>,
    pub opponent_username: Option<String>,
    pub session_id: Option<String>,
    pub my_choice: ChoiceSlot,
    pub opponent_choice: ChoiceSlot,
    /// Server result text, empty while the round is open.
    pub round_result: String,
    pub round_outcome: RoundOutcome,
    pub round_reason: String,
    pub your_score: u32,
    pub opponent_score: Option<u32>,
    pub win_streak: u32,
    pub longest_streak: u32,
    pub has_made_choice: bool,
    pub joining_countdown: u32,
    pub user_message: String,
    pub round_status: String,
    pub connection_message: String,
    pub timer: TimerState,
    pub coin_change: i64,
    pub game_end: Option<GameEndRecord>,
}

// ── Session ─────────────────────────────────────────────────────────

/// Authoritative round fields, written only by server events.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct RoundState {
    my_choice: ChoiceSlot,
    opponent_choice: ChoiceSlot,
    result: String,
    outcome: RoundOutcome,
    reason: String,
}

/// The match session state machine.
pub struct Session<S> {
    sink: S,
    config: SessionConfig,
    timer: TurnTimer,

    phase: Phase,
    player: Option<StartParams>,
    session_id: Option<String>,
    confirmed_username: Option<String>,
    opponent_username: Option<String>,

    round: RoundState,
    your_score: u32,
    opponent_score: Option<u32>,
    win_streak: u32,
    longest_streak: u32,
    joining_countdown: u32,

    user_message: String,
    round_status: String,
    connection_message: String,
    game_end: Option<GameEndRecord>,

    // Optimistic overlay.
    pending_choice: Option<Choice>,
    coin_change: i64,
    coin_change_expires: Option<Instant>,

    phase_deadline: Option<Instant>,
    resync_pending: bool,
    effects: Vec<SideEffect>,
}

impl<S: CommandSink> Session<S> {
    /// Create an idle session that emits through `sink`.
    pub fn new(sink: S, config: SessionConfig) -> Self {
        let joining_countdown = config.joining_countdown;
        Self {
            sink,
            config,
            timer: TurnTimer::new(),
            phase: Phase::Idle,
            player: None,
            session_id: None,
            confirmed_username: None,
            opponent_username: None,
            round: RoundState::default(),
            your_score: 0,
            opponent_score: None,
            win_streak: 0,
            longest_streak: 0,
            joining_countdown,
            user_message: String::new(),
            round_status: String::new(),
            connection_message: String::new(),
            game_end: None,
            pending_choice: None,
            coin_change: 0,
            coin_change_expires: None,
            phase_deadline: None,
            resync_pending: false,
            effects: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// `true` between a successful [`submit_choice`](Self::submit_choice)
    /// and the next round result.
    pub fn has_made_choice(&self) -> bool {
        self.pending_choice.is_some()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Subscribe to turn timer ticks.
    pub fn timer_updates(&self) -> watch::Receiver<TimerState> {
        self.timer.subscribe()
    }

    /// Drain queued side effects.
    pub fn take_effects(&mut self) -> Vec<SideEffect> {
        std::mem::take(&mut self.effects)
    }

    // ── User actions ────────────────────────────────────────────────

    /// Enter matchmaking.
    ///
    /// A blank username or a missing connection leaves the phase unchanged
    /// and sets a user-facing message; the latter also asks for a reconnect.
    pub fn start(&mut self, params: StartParams) {
        let username = params.username.trim().to_string();
        if username.is_empty() {
            self.user_message = MSG_NO_USERNAME.into();
            return;
        }
        if self.phase != Phase::Idle {
            warn!(phase = %self.phase, "start ignored outside idle phase");
            return;
        }
        if !self.sink.is_connected() {
            self.user_message = MSG_CANNOT_CONNECT.into();
            self.sink.request_reconnect();
            return;
        }

        let command = ClientCommand::Start {
            username: username.clone(),
            user_id: params.user_id,
            group_owner: params.group_owner.clone(),
        };
        if let Err(e) = self.sink.emit(command) {
            warn!("start not sent: {e}");
            self.user_message = MSG_CANNOT_CONNECT.into();
            self.sink.request_reconnect();
            return;
        }

        let previous = self.player.as_ref().map(|p| p.username.as_str());
        if previous != Some(username.as_str()) {
            self.effects.push(SideEffect::FetchProfile {
                username: username.clone(),
                role: ProfileRole::User,
            });
        }
        self.player = Some(StartParams { username, ..params });
        self.user_message.clear();
        self.round_status = MSG_SEARCHING.into();
        self.set_phase(Phase::Searching);
    }

    /// Lock in a choice for the open round.
    ///
    /// Returns `false` without touching state when the phase is not
    /// Playing, a choice is already pending, no session is held, or the
    /// connection is down.
    pub fn submit_choice(&mut self, choice: Choice) -> bool {
        if self.phase != Phase::Playing || self.pending_choice.is_some() {
            return false;
        }
        let Some(session_id) = self.session_id.clone() else {
            return false;
        };
        if !self.sink.is_connected() {
            return false;
        }

        if let Err(e) = self
            .sink
            .emit(ClientCommand::MakeChoice { session_id, choice })
        {
            warn!("make_choice not sent: {e}");
            return false;
        }

        debug!(%choice, "choice locked");
        self.pending_choice = Some(choice);
        self.round_status = MSG_CHOICE_LOCKED.into();
        self.timer.stop();
        true
    }

    /// Send a cosmetic reaction to the opponent.
    pub fn submit_reaction(&mut self, reaction: impl Into<String>) {
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        if self.phase != Phase::Playing || !self.sink.is_connected() {
            return;
        }
        let reaction = reaction.into();
        if let Err(e) = self.sink.emit(ClientCommand::MakeReaction {
            session_id,
            reaction,
        }) {
            debug!("reaction not sent: {e}");
        }
    }

    /// End the session locally. Does not wait for the server.
    pub fn end_game(&mut self) {
        if let Some(session_id) = self.session_id.clone() {
            if self.sink.is_connected() {
                if let Err(e) = self.sink.emit(ClientCommand::EndGame { session_id }) {
                    warn!("end_game not sent: {e}");
                }
            }
        }

        if let Some(player) = &self.player {
            if let Some(user_id) = player.user_id {
                if self.your_score > 0 || self.longest_streak > 0 {
                    self.effects.push(SideEffect::SubmitScore(ScoreSubmission {
                        client_inline_message_id: player.inline_message_id.clone(),
                        user_id,
                        score: self.your_score,
                    }));
                }
            }
        }

        let scores = self.current_scores();
        self.finish(MSG_YOU_ENDED.into(), scores, true);
    }

    /// Ask the server to leave the matchmaking queue.
    ///
    /// The phase changes when the server confirms with `matchmaking_cancelled`.
    pub fn cancel_search(&mut self) {
        if self.phase != Phase::Searching {
            self.user_message = MSG_NOT_SEARCHING.into();
            return;
        }
        if !self.sink.is_connected() {
            self.user_message = MSG_NOT_CONNECTED.into();
            return;
        }
        if let Err(e) = self.sink.emit(ClientCommand::CancelMatchmaking) {
            warn!("cancel_matchmaking not sent: {e}");
            self.user_message = MSG_NOT_CONNECTED.into();
        }
    }

    /// Leave the Ended phase for Idle, if the server allows another match.
    pub fn play_again(&mut self) {
        match &self.game_end {
            Some(record) if self.phase == Phase::Ended && record.can_play_again => {
                self.reset_to_start(None);
            }
            _ => debug!(phase = %self.phase, "play again not available"),
        }
    }

    /// Return to Idle, clearing every session and round field.
    ///
    /// Cancels matchmaking first when called while Searching. Idempotent.
    pub fn reset_to_start(&mut self, message: Option<String>) {
        if self.phase == Phase::Searching && self.sink.is_connected() {
            debug!("resetting from searching, cancelling matchmaking");
            if let Err(e) = self.sink.emit(ClientCommand::CancelMatchmaking) {
                warn!("cancel_matchmaking not sent: {e}");
            }
        }
        self.clear_to_idle();
        self.user_message = message.unwrap_or_default();
    }

    fn clear_to_idle(&mut self) {
        self.set_phase(Phase::Idle);
        self.session_id = None;
        self.opponent_username = None;
        self.confirmed_username = None;
        self.round = RoundState::default();
        self.your_score = 0;
        self.opponent_score = None;
        self.win_streak = 0;
        self.pending_choice = None;
        self.round_status.clear();
        self.joining_countdown = self.config.joining_countdown;
        self.game_end = None;
        self.phase_deadline = None;
        self.resync_pending = false;
        self.timer.reset();
    }

    // ── Local deadlines ─────────────────────────────────────────────

    /// Earliest instant at which [`advance`](Self::advance) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.phase_deadline, self.coin_change_expires) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run every local transition due at or before `now`.
    pub fn advance(&mut self, now: Instant) {
        if self.coin_change_expires.is_some_and(|at| at <= now) {
            self.coin_change = 0;
            self.coin_change_expires = None;
        }

        while let Some(due) = self.phase_deadline.filter(|due| *due <= now) {
            match self.phase {
                Phase::OpponentFound => {
                    self.joining_countdown = self.config.joining_countdown;
                    self.set_phase(Phase::Joining);
                    if self.joining_countdown == 0 {
                        self.enter_playing();
                    } else {
                        self.phase_deadline = Some(due + self.config.countdown_step);
                    }
                }
                Phase::Joining => {
                    self.joining_countdown = self.joining_countdown.saturating_sub(1);
                    if self.joining_countdown == 0 {
                        self.enter_playing();
                    } else {
                        self.phase_deadline = Some(due + self.config.countdown_step);
                    }
                }
                _ => self.phase_deadline = None,
            }
        }
    }

    /// Round state was cleared by `match_found`; anything the server sent
    /// during the countdown is kept.
    fn enter_playing(&mut self) {
        self.phase_deadline = None;
        let untouched = self.round == RoundState::default()
            && self.round_status.is_empty()
            && !self.timer.is_active();
        if untouched {
            self.round_status = MSG_GAME_STARTED.into();
        }
        self.set_phase(Phase::Playing);
    }

    // ── Event handling ──────────────────────────────────────────────

    /// Apply one event from the connection manager.
    pub fn handle_event(&mut self, event: MatchEvent) {
        match event {
            MatchEvent::Connected => {
                self.connection_message.clear();
                if self.resync_pending {
                    self.resync_pending = false;
                    if let Some(session_id) = self.session_id.clone() {
                        info!(%session_id, "reconnected mid-session, requesting resync");
                        if let Err(e) = self.sink.emit(ClientCommand::Resync { session_id }) {
                            warn!("resync not sent: {e}");
                        }
                    }
                }
            }
            MatchEvent::ConnectionFailed { reason, will_retry } => {
                self.connection_message = if will_retry {
                    format!("Connection failed: {reason}. Retrying...")
                } else {
                    format!("Connection failed: {reason}.")
                };
            }
            MatchEvent::Disconnected { reason, origin } => {
                self.connection_message =
                    format!("Disconnected: {}.", reason.as_deref().unwrap_or("unknown"));
                self.timer.stop();
                if origin == DisconnectOrigin::Client {
                    return;
                }
                if self.phase.in_match() {
                    self.resync_pending = true;
                } else if self.phase == Phase::Searching {
                    // The queue entry belonged to the old socket; a cancel
                    // on the next one would only earn a `not_in_queue`.
                    info!("connection lost while searching, returning to idle");
                    self.clear_to_idle();
                    self.user_message = MSG_LOST_WHILE_SEARCHING.into();
                }
            }
            MatchEvent::Server(event) => self.handle_server_event(event),
        }
    }

    /// Apply one protocol event, validated against the current phase.
    pub fn handle_server_event(&mut self, event: ServerEvent) {
        let name = event.name();
        debug!(event = name, phase = %self.phase, "server event");

        match event {
            ServerEvent::ConnectionAccepted { .. } => {}
            ServerEvent::MatchFound {
                session_id,
                opponent,
                your_username,
            } => {
                if self.phase != Phase::Searching {
                    return self.ignore(name);
                }
                self.on_match_found(session_id, opponent, your_username);
            }
            ServerEvent::WaitingForOpponent { message } => {
                if self.phase != Phase::Searching {
                    return self.ignore(name);
                }
                self.round_status = message;
            }
            ServerEvent::AlreadyInQueue { message }
            | ServerEvent::AlreadyInSession { message }
            | ServerEvent::MatchmakingFailedSystemError { message } => {
                if !self.phase.accepts_queue_events() {
                    return self.ignore(name);
                }
                self.reset_to_start(Some(message));
            }
            ServerEvent::MatchmakingFailedInsufficientCoins {
                message,
                required,
                current_balance,
            } => {
                if !self.phase.accepts_queue_events() {
                    return self.ignore(name);
                }
                let message = if message.is_empty() {
                    format!("Not enough coins: {required} required, {current_balance} available.")
                } else {
                    message
                };
                self.reset_to_start(Some(message));
            }
            ServerEvent::MatchmakingCancelled { message } => {
                if !self.phase.accepts_queue_events() {
                    info!(phase = %self.phase, "matchmaking cancelled by server, leaving match");
                }
                if self.phase != Phase::Idle {
                    self.clear_to_idle();
                }
                self.user_message = if message.is_empty() {
                    MSG_MATCHMAKING_CANCELLED.into()
                } else {
                    message
                };
                self.round_status.clear();
            }
            ServerEvent::NotInQueue { message } | ServerEvent::CannotCancelInGame { message } => {
                self.user_message = message;
            }
            ServerEvent::ChoiceRegistered { message } => {
                if !self.phase.in_match() {
                    return self.ignore(name);
                }
                self.round_status = if message.is_empty() {
                    MSG_CHOICE_REGISTERED.into()
                } else {
                    message
                };
            }
            ServerEvent::OpponentMadeChoice {
                message,
                timer_details,
            } => {
                if !self.phase.in_match() {
                    return self.ignore(name);
                }
                self.on_opponent_made_choice(message, timer_details);
            }
            ServerEvent::RoundResult(payload) => {
                if !self.phase.in_match() {
                    return self.ignore(name);
                }
                self.on_round_result(*payload);
            }
            ServerEvent::OpponentDisconnected { message } => {
                if !self.phase.in_match() {
                    return self.ignore(name);
                }
                let reason = non_empty_or(message, MSG_OPPONENT_LEFT);
                let scores = self.current_scores();
                self.finish(reason, scores, true);
            }
            ServerEvent::GameEnded { message, initiator } => {
                if !self.phase.in_match() {
                    return self.ignore(name);
                }
                let reason = match initiator {
                    Some(initiator) => format!("{initiator} ended the game."),
                    None => non_empty_or(message, MSG_GAME_ENDED),
                };
                let scores = self.current_scores();
                self.finish(reason, scores, true);
            }
            ServerEvent::GameEndedInsufficientFunds(payload) => {
                if !self.phase.in_match() {
                    return self.ignore(name);
                }
                self.on_insufficient_funds(*payload);
            }
            ServerEvent::ErrorOccurred { message } => {
                warn!("server error: {message}");
                self.user_message = format!("Error: {message}");
                self.timer.stop();
            }
            ServerEvent::OpponentForfeitCoins { message } | ServerEvent::ForfeitCoins { message } => {
                self.round_status = message;
            }
            ServerEvent::SessionResynced(payload) => {
                if !self.phase.in_match() || self.session_id.as_deref() != Some(&payload.session_id)
                {
                    return self.ignore(name);
                }
                self.on_resynced(*payload);
            }
            ServerEvent::SessionInvalid { message } => {
                if !self.phase.in_match() {
                    return self.ignore(name);
                }
                let reason = non_empty_or(message, MSG_SESSION_GONE);
                let scores = self.current_scores();
                self.finish(reason, scores, true);
            }
        }
    }

    fn on_match_found(&mut self, session_id: String, opponent: String, confirmed: String) {
        info!(%session_id, %opponent, "match found");

        let local = self.player.as_ref().map(|p| p.username.as_str());
        if !confirmed.is_empty() && local != Some(confirmed.as_str()) {
            self.effects.push(SideEffect::FetchProfile {
                username: confirmed.clone(),
                role: ProfileRole::User,
            });
        }
        self.effects.push(SideEffect::FetchProfile {
            username: opponent.clone(),
            role: ProfileRole::Opponent,
        });

        self.session_id = Some(session_id);
        self.opponent_username = Some(opponent);
        self.confirmed_username = Some(confirmed);
        self.round = RoundState::default();
        self.pending_choice = None;
        self.your_score = 0;
        self.opponent_score = Some(0);
        self.win_streak = 0;
        self.longest_streak = 0;
        self.round_status.clear();
        self.user_message.clear();
        self.game_end = None;
        self.timer.reset();
        self.joining_countdown = self.config.joining_countdown;
        self.phase_deadline = Some(Instant::now() + self.config.opponent_found_delay);
        self.set_phase(Phase::OpponentFound);
    }

    fn on_opponent_made_choice(&mut self, message: String, timer: Option<TimerDetails>) {
        self.round_status = message;

        if self.pending_choice.is_some() {
            self.round_status = MSG_REVEALING.into();
            self.timer.stop();
            return;
        }

        if let Some(details) = timer {
            let me = self.sink.connection_id();
            if me.as_deref() == Some(details.active_for.as_str()) {
                debug!(duration_ms = details.duration_ms, "turn timer on local player");
                self.timer.start(Duration::from_millis(details.duration_ms));
            }
        }
    }

    fn on_round_result(&mut self, payload: RoundResultPayload) {
        let outcome = payload.outcome();
        debug!(?outcome, "round result");

        self.round = RoundState {
            my_choice: ChoiceSlot::resolved(payload.your_choice),
            opponent_choice: ChoiceSlot::resolved(payload.opponent_choice),
            result: payload.result,
            outcome,
            reason: payload.reason.clone().unwrap_or_default(),
        };
        self.your_score = payload.scores.current_player;
        self.opponent_score = Some(payload.scores.opponent);

        match outcome {
            RoundOutcome::Win => {
                self.win_streak += 1;
                self.longest_streak = self.longest_streak.max(self.win_streak);
            }
            RoundOutcome::Loss => self.win_streak = 0,
            // A tie leaves the streak where it was.
            RoundOutcome::Tie | RoundOutcome::Pending => {}
        }

        let delta = match outcome {
            RoundOutcome::Win => self.config.coin_reward,
            RoundOutcome::Loss => -self.config.coin_reward,
            RoundOutcome::Tie | RoundOutcome::Pending => 0,
        };
        if delta != 0 {
            self.coin_change = delta;
            self.coin_change_expires = Some(Instant::now() + self.config.coin_change_display);
            self.effects.push(SideEffect::ApplyCoinDelta(delta));
        }

        self.pending_choice = None;
        self.round_status = payload
            .reason
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| MSG_NEXT_MOVE.into());
        self.timer.stop();
    }

    fn on_insufficient_funds(&mut self, payload: InsufficientFundsPayload) {
        let me = self.sink.connection_id();
        let session = &payload.session;

        let scores = match me {
            Some(me) if !session.scores.is_empty() => {
                let player = session.scores.get(&me).copied().unwrap_or(0);
                let opponent = session
                    .players
                    .iter()
                    .find(|p| p.socket_id != me)
                    .and_then(|p| {
                        session
                            .scores
                            .get(&p.socket_id)
                            .copied()
                            .or(self.opponent_score)
                    });
                FinalScores { player, opponent }
            }
            _ => self.current_scores(),
        };

        self.finish(payload.message, scores, payload.can_continue);
    }

    fn on_resynced(&mut self, payload: SessionResyncPayload) {
        info!(session_id = %payload.session_id, "session resynced");
        self.opponent_username = Some(payload.opponent);
        self.confirmed_username = Some(payload.your_username);
        self.your_score = payload.scores.current_player;
        self.opponent_score = Some(payload.scores.opponent);
        self.resync_pending = false;

        // The server lost the choice we sent before the drop.
        if !payload.has_chosen && self.pending_choice.take().is_some() {
            self.round_status = MSG_NEXT_MOVE.into();
        }
    }

    fn current_scores(&self) -> FinalScores {
        FinalScores {
            player: self.your_score,
            opponent: self.opponent_score,
        }
    }

    fn finish(&mut self, reason: String, final_scores: FinalScores, can_play_again: bool) {
        info!(%reason, "game ended");
        self.game_end = Some(GameEndRecord {
            reason,
            final_scores,
            can_play_again,
        });
        self.pending_choice = None;
        self.phase_deadline = None;
        self.resync_pending = false;
        self.timer.reset();
        self.set_phase(Phase::Ended);

        // Replace the optimistic balance with the server's.
        let local = self
            .confirmed_username
            .clone()
            .or_else(|| self.player.as_ref().map(|p| p.username.clone()));
        if let Some(username) = local {
            self.effects.push(SideEffect::FetchProfile {
                username,
                role: ProfileRole::User,
            });
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "phase transition");
            self.phase = phase;
        }
    }

    fn ignore(&self, event: &str) {
        warn!(event, phase = %self.phase, "ignoring event in unexpected phase");
    }

    // ── Snapshot ────────────────────────────────────────────────────

    /// Owned view of the current state, with the optimistic overlay applied.
    pub fn snapshot(&self) -> SessionSnapshot {
        let (my_choice, opponent_choice, round_result, round_outcome, round_reason) =
            match self.pending_choice {
                Some(choice) => (
                    ChoiceSlot::Chosen(choice),
                    ChoiceSlot::Unchosen,
                    String::new(),
                    RoundOutcome::Pending,
                    String::new(),
                ),
                None => (
                    self.round.my_choice,
                    self.round.opponent_choice,
                    self.round.result.clone(),
                    self.round.outcome,
                    self.round.reason.clone(),
                ),
            };

        SessionSnapshot {
            phase: self.phase,
            connected: self.sink.is_connected(),
            username: self.player.as_ref().map(|p| p.username.clone()),
            confirmed_username: self.confirmed_username.clone(),
            opponent_username: self.opponent_username.clone(),
            session_id: self.session_id.clone(),
            my_choice,
            opponent_choice,
            round_result,
            round_outcome,
            round_reason,
            your_score: self.your_score,
            opponent_score: self.opponent_score,
            win_streak: self.win_streak,
            longest_streak: self.longest_streak,
            has_made_choice: self.pending_choice.is_some(),
            joining_countdown: self.joining_countdown,
            user_message: self.user_message.clone(),
            round_status: self.round_status.clone(),
            connection_message: self.connection_message.clone(),
            timer: self.timer.state(),
            coin_change: self.coin_change,
            game_end: self.game_end.clone(),
        }
    }
}

impl<S> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("phase", &self.phase)
            .field("session_id", &self.session_id)
            .field("pending_choice", &self.pending_choice)
            .field("your_score", &self.your_score)
            .field("opponent_score", &self.opponent_score)
            .finish_non_exhaustive()
    }
}

fn non_empty_or(message: String, fallback: &str) -> String {
    if message.is_empty() {
        fallback.to_string()
    } else {
        message
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
    use crate::protocol::{RoundScores, SessionPlayer, SessionRecord};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<ClientCommand>>>,
        connected: Arc<AtomicBool>,
        reconnects: Arc<AtomicU32>,
    }

    impl Recorder {
        fn online() -> Self {
            let r = Self::default();
            r.connected.store(true, Ordering::SeqCst);
            r
        }

        fn sent(&self) -> Vec<ClientCommand> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl CommandSink for Recorder {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn connection_id(&self) -> Option<String> {
            Some("me".into())
        }

        fn emit(&self, command: ClientCommand) -> Result<()> {
            self.sent.lock().unwrap().push(command);
            Ok(())
        }

        fn request_reconnect(&self) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn playing_session() -> (Session<Recorder>, Recorder) {
        let rec = Recorder::online();
        let config = SessionConfig::default()
            .with_opponent_found_delay(Duration::ZERO)
            .with_joining_countdown(0, Duration::ZERO);
        let mut session = Session::new(rec.clone(), config);
        session.start(StartParams::new("alice").with_user_id(42));
        session.handle_server_event(ServerEvent::MatchFound {
            session_id: "s1".into(),
            opponent: "bob".into(),
            your_username: "alice".into(),
        });
        session.advance(Instant::now());
        assert_eq!(session.phase(), Phase::Playing);
        (session, rec)
    }

    fn round(result: &str, me: u32, them: u32) -> ServerEvent {
        ServerEvent::RoundResult(Box::new(RoundResultPayload {
            your_choice: Some(Choice::Rock),
            opponent_choice: None,
            result: result.into(),
            reason: None,
            scores: RoundScores {
                current_player: me,
                opponent: them,
            },
        }))
    }

    #[tokio::test]
    async fn start_without_connection_requests_reconnect() {
        let rec = Recorder::default();
        let mut session = Session::new(rec.clone(), SessionConfig::default());

        session.start(StartParams::new("alice"));

        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.snapshot().user_message, MSG_CANNOT_CONNECT);
        assert_eq!(rec.reconnects.load(Ordering::SeqCst), 1);
        assert!(rec.sent().is_empty());
    }

    #[tokio::test]
    async fn blank_username_is_rejected() {
        let rec = Recorder::online();
        let mut session = Session::new(rec.clone(), SessionConfig::default());

        session.start(StartParams::new("   "));

        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.snapshot().user_message, MSG_NO_USERNAME);
        assert!(rec.sent().is_empty());
    }

    #[tokio::test]
    async fn tie_leaves_streak_unchanged() {
        let (mut session, _rec) = playing_session();
        session.handle_server_event(round("You won!", 1, 0));
        session.handle_server_event(round("It's a tie!", 1, 0));
        assert_eq!(session.snapshot().win_streak, 1);

        session.handle_server_event(round("You won!", 2, 0));
        session.handle_server_event(round("You lost!", 2, 1));
        let snap = session.snapshot();
        assert_eq!(snap.win_streak, 0);
        assert_eq!(snap.longest_streak, 2);
    }

    #[tokio::test]
    async fn null_choices_render_as_timed_out() {
        let (mut session, _rec) = playing_session();
        session.handle_server_event(round("You won!", 1, 0));
        let snap = session.snapshot();
        assert_eq!(snap.my_choice, ChoiceSlot::Chosen(Choice::Rock));
        assert_eq!(snap.opponent_choice, ChoiceSlot::TimedOut);
        assert_eq!(snap.opponent_choice.glyph(), "⏳");
    }

    #[tokio::test(start_paused = true)]
    async fn coin_delta_is_optimistic_and_expires() {
        let (mut session, _rec) = playing_session();
        let _ = session.take_effects();

        session.handle_server_event(round("You lost!", 0, 1));
        assert_eq!(session.take_effects(), vec![SideEffect::ApplyCoinDelta(-10)]);
        assert_eq!(session.snapshot().coin_change, -10);

        let due = session.next_deadline().unwrap();
        session.advance(due);
        assert_eq!(session.snapshot().coin_change, 0);
        assert!(session.next_deadline().is_none());
    }

    #[tokio::test]
    async fn tie_applies_no_coin_delta() {
        let (mut session, _rec) = playing_session();
        let _ = session.take_effects();
        session.handle_server_event(round("It's a tie!", 0, 0));
        assert!(session.take_effects().is_empty());
    }

    #[tokio::test]
    async fn opponent_choice_after_local_choice_signals_reveal() {
        let (mut session, _rec) = playing_session();
        assert!(session.submit_choice(Choice::Paper));

        session.handle_server_event(ServerEvent::OpponentMadeChoice {
            message: "Opponent chose".into(),
            timer_details: Some(TimerDetails {
                active_for: "me".into(),
                duration_ms: 5_000,
            }),
        });

        let snap = session.snapshot();
        assert_eq!(snap.round_status, MSG_REVEALING);
        assert!(!snap.timer.active);
    }

    #[tokio::test]
    async fn timer_only_starts_for_local_player() {
        let (mut session, _rec) = playing_session();

        session.handle_server_event(ServerEvent::OpponentMadeChoice {
            message: "Opponent chose".into(),
            timer_details: Some(TimerDetails {
                active_for: "someone-else".into(),
                duration_ms: 5_000,
            }),
        });
        assert!(!session.snapshot().timer.active);

        session.handle_server_event(ServerEvent::OpponentMadeChoice {
            message: "Opponent chose".into(),
            timer_details: Some(TimerDetails {
                active_for: "me".into(),
                duration_ms: 5_000,
            }),
        });
        let snap = session.snapshot();
        assert!(snap.timer.active);
        assert_eq!(snap.timer.duration, Duration::from_secs(5));
        assert_eq!(snap.round_status, "Opponent chose");
    }

    #[tokio::test]
    async fn insufficient_funds_reads_scores_by_connection_id() {
        let (mut session, _rec) = playing_session();
        session.handle_server_event(round("You won!", 1, 0));

        let mut scores = HashMap::new();
        scores.insert("me".to_string(), 3);
        scores.insert("them".to_string(), 2);
        session.handle_server_event(ServerEvent::GameEndedInsufficientFunds(Box::new(
            InsufficientFundsPayload {
                message: "Out of coins".into(),
                can_continue: false,
                session: SessionRecord {
                    session_id: Some("s1".into()),
                    players: vec![
                        SessionPlayer {
                            socket_id: "me".into(),
                            username: "alice".into(),
                        },
                        SessionPlayer {
                            socket_id: "them".into(),
                            username: "bob".into(),
                        },
                    ],
                    scores,
                },
            },
        )));

        let record = session.snapshot().game_end.unwrap();
        assert_eq!(session.phase(), Phase::Ended);
        assert_eq!(record.reason, "Out of coins");
        assert_eq!(
            record.final_scores,
            FinalScores {
                player: 3,
                opponent: Some(2)
            }
        );
        assert!(!record.can_play_again);

        // Play again is refused when the server says so.
        session.play_again();
        assert_eq!(session.phase(), Phase::Ended);
    }

    #[tokio::test]
    async fn match_found_outside_search_is_ignored() {
        let rec = Recorder::online();
        let mut session = Session::new(rec, SessionConfig::default());

        session.handle_server_event(ServerEvent::MatchFound {
            session_id: "s9".into(),
            opponent: "eve".into(),
            your_username: "alice".into(),
        });

        assert_eq!(session.phase(), Phase::Idle);
        assert!(session.session_id().is_none());
    }

    #[tokio::test]
    async fn queue_rejection_mid_match_is_ignored() {
        let (mut session, _rec) = playing_session();
        session.handle_server_event(ServerEvent::AlreadyInQueue {
            message: "late".into(),
        });
        assert_eq!(session.phase(), Phase::Playing);
        assert_eq!(session.session_id(), Some("s1"));
    }

    #[tokio::test]
    async fn end_game_submits_score_when_earned() {
        let (mut session, rec) = playing_session();
        session.handle_server_event(round("You won!", 1, 0));
        let _ = session.take_effects();

        session.end_game();

        assert!(rec.sent().contains(&ClientCommand::EndGame {
            session_id: "s1".into()
        }));
        assert_eq!(
            session.take_effects(),
            vec![
                SideEffect::SubmitScore(ScoreSubmission {
                    client_inline_message_id: None,
                    user_id: 42,
                    score: 1,
                }),
                SideEffect::FetchProfile {
                    username: "alice".into(),
                    role: ProfileRole::User,
                },
            ]
        );
        let record = session.snapshot().game_end.unwrap();
        assert_eq!(record.reason, MSG_YOU_ENDED);
        assert!(record.can_play_again);
    }

    #[tokio::test]
    async fn end_game_without_score_skips_submission() {
        let (mut session, _rec) = playing_session();
        let _ = session.take_effects();
        session.end_game();
        assert!(!session
            .take_effects()
            .iter()
            .any(|e| matches!(e, SideEffect::SubmitScore(_))));
        assert_eq!(session.phase(), Phase::Ended);
    }

    #[tokio::test]
    async fn reconnect_mid_match_requests_resync() {
        let (mut session, rec) = playing_session();
        assert!(session.submit_choice(Choice::Scissors));

        session.handle_event(MatchEvent::Disconnected {
            reason: Some("reset".into()),
            origin: DisconnectOrigin::Transport,
        });
        session.handle_event(MatchEvent::Connected);

        assert_eq!(
            rec.sent().last(),
            Some(&ClientCommand::Resync {
                session_id: "s1".into()
            })
        );

        session.handle_server_event(ServerEvent::SessionResynced(Box::new(
            SessionResyncPayload {
                session_id: "s1".into(),
                opponent: "bob".into(),
                your_username: "alice".into(),
                scores: RoundScores {
                    current_player: 2,
                    opponent: 1,
                },
                has_chosen: false,
            },
        )));

        let snap = session.snapshot();
        assert!(!snap.has_made_choice);
        assert_eq!(snap.your_score, 2);
        assert_eq!(snap.opponent_score, Some(1));
        assert_eq!(snap.round_status, MSG_NEXT_MOVE);
    }

    #[tokio::test]
    async fn client_disconnect_does_not_resync() {
        let (mut session, rec) = playing_session();
        let before = rec.sent().len();
        session.handle_event(MatchEvent::Disconnected {
            reason: None,
            origin: DisconnectOrigin::Client,
        });
        session.handle_event(MatchEvent::Connected);
        assert_eq!(rec.sent().len(), before);
    }

    #[tokio::test]
    async fn session_invalid_ends_the_match() {
        let (mut session, _rec) = playing_session();
        session.handle_server_event(ServerEvent::SessionInvalid {
            message: String::new(),
        });
        assert_eq!(session.phase(), Phase::Ended);
        assert_eq!(session.snapshot().game_end.unwrap().reason, MSG_SESSION_GONE);
    }

    #[tokio::test]
    async fn game_ended_names_initiator() {
        let (mut session, _rec) = playing_session();
        session.handle_server_event(ServerEvent::GameEnded {
            message: "ignored".into(),
            initiator: Some("bob".into()),
        });
        assert_eq!(
            session.snapshot().game_end.unwrap().reason,
            "bob ended the game."
        );
    }

    #[tokio::test]
    async fn connection_messages_follow_lifecycle() {
        let rec = Recorder::online();
        let mut session = Session::new(rec, SessionConfig::default());

        session.handle_event(MatchEvent::ConnectionFailed {
            reason: "refused".into(),
            will_retry: true,
        });
        assert_eq!(
            session.snapshot().connection_message,
            "Connection failed: refused. Retrying..."
        );

        session.handle_event(MatchEvent::Connected);
        assert!(session.snapshot().connection_message.is_empty());

        session.handle_event(MatchEvent::Disconnected {
            reason: Some("server closed the connection".into()),
            origin: DisconnectOrigin::Server,
        });
        assert_eq!(
            session.snapshot().connection_message,
            "Disconnected: server closed the connection."
        );
    }
}

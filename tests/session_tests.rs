#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for the session state machine, driven through the
//! public API with a recording command sink.

mod common;

use std::time::Duration;

use common::*;
use rps_match_client::protocol::{Choice, ClientCommand, ServerEvent};
use rps_match_client::session::ProfileRole;
use rps_match_client::{
    ChoiceSlot, DisconnectOrigin, MatchEvent, Phase, Session, SessionConfig, SideEffect,
    StartParams,
};
use tokio::time::Instant;

fn new_session() -> (Session<SinkProbe>, SinkProbe) {
    let sink = SinkProbe::connected();
    (Session::new(sink.clone(), SessionConfig::default()), sink)
}

/// Walk a fresh session through matchmaking and the countdown into Playing.
fn playing() -> (Session<SinkProbe>, SinkProbe) {
    let (mut session, sink) = new_session();
    session.start(StartParams::new("alice").with_user_id(42));
    session.handle_server_event(match_found("s1", "bob", "alice"));
    session.advance(Instant::now() + Duration::from_secs(60));
    assert_eq!(session.phase(), Phase::Playing);
    session.take_effects();
    (session, sink)
}

fn win() -> ServerEvent {
    round_result(Some(Choice::Rock), Some(Choice::Scissors), "You won!", (1, 0))
}

fn loss() -> ServerEvent {
    round_result(Some(Choice::Rock), Some(Choice::Paper), "You lost!", (0, 1))
}

fn tie() -> ServerEvent {
    round_result(Some(Choice::Rock), Some(Choice::Rock), "It's a tie!", (0, 0))
}

// ════════════════════════════════════════════════════════════════════
// Walkthrough
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn start_enters_searching() {
    let (mut session, sink) = new_session();

    session.start(StartParams::new("alice").with_user_id(42));

    assert_eq!(session.phase(), Phase::Searching);
    assert_eq!(
        sink.sent(),
        vec![ClientCommand::Start {
            username: "alice".into(),
            user_id: Some(42),
            group_owner: None,
        }]
    );
    assert_eq!(
        session.take_effects(),
        vec![SideEffect::FetchProfile {
            username: "alice".into(),
            role: ProfileRole::User,
        }]
    );
}

#[tokio::test]
async fn match_found_resets_scores() {
    let (mut session, _sink) = new_session();
    session.start(StartParams::new("alice"));

    session.handle_server_event(match_found("s1", "bob", "alice"));

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::OpponentFound);
    assert_eq!(snap.session_id.as_deref(), Some("s1"));
    assert_eq!(snap.opponent_username.as_deref(), Some("bob"));
    assert_eq!(snap.your_score, 0);
    assert_eq!(snap.opponent_score, Some(0));
    assert!(session.take_effects().contains(&SideEffect::FetchProfile {
        username: "bob".into(),
        role: ProfileRole::Opponent,
    }));
}

#[tokio::test(start_paused = true)]
async fn countdown_runs_on_deadlines() {
    let (mut session, _sink) = new_session();
    session.start(StartParams::new("alice"));
    session.handle_server_event(match_found("s1", "bob", "alice"));
    let found_at = Instant::now();

    // Opponent-found pause.
    assert_eq!(
        session.next_deadline(),
        Some(found_at + Duration::from_secs(2))
    );
    session.advance(found_at + Duration::from_millis(1999));
    assert_eq!(session.phase(), Phase::OpponentFound);

    session.advance(found_at + Duration::from_secs(2));
    assert_eq!(session.phase(), Phase::Joining);
    assert_eq!(session.snapshot().joining_countdown, 2);

    session.advance(found_at + Duration::from_secs(3));
    assert_eq!(session.phase(), Phase::Joining);
    assert_eq!(session.snapshot().joining_countdown, 1);

    session.advance(found_at + Duration::from_secs(4));
    assert_eq!(session.phase(), Phase::Playing);
    assert_eq!(session.next_deadline(), None);
}

#[tokio::test]
async fn events_during_countdown_survive_into_playing() {
    let (mut session, _sink) = new_session();
    session.start(StartParams::new("alice"));
    session.handle_server_event(match_found("s1", "bob", "alice"));

    session.handle_server_event(opponent_made_choice(Some("me"), 10_000));
    assert_eq!(session.phase(), Phase::OpponentFound);
    assert!(session.snapshot().timer.active);

    session.advance(Instant::now() + Duration::from_secs(60));

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::Playing);
    assert!(snap.timer.active);
    assert_eq!(snap.round_status, "Opponent has made their choice.");
}

#[tokio::test]
async fn round_result_during_countdown_is_kept() {
    let (mut session, _sink) = new_session();
    session.start(StartParams::new("alice"));
    session.handle_server_event(match_found("s1", "bob", "alice"));
    session.advance(Instant::now() + Duration::from_secs(2));
    assert_eq!(session.phase(), Phase::Joining);

    session.handle_server_event(win());
    session.advance(Instant::now() + Duration::from_secs(60));

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::Playing);
    assert_eq!(snap.round_result, "You won!");
    assert_eq!(snap.my_choice, ChoiceSlot::Chosen(Choice::Rock));
    assert_eq!(snap.your_score, 1);
}

#[tokio::test]
async fn submit_choice_locks_the_round() {
    let (mut session, sink) = playing();

    assert!(session.submit_choice(Choice::Rock));

    assert_eq!(
        sink.sent().last(),
        Some(&ClientCommand::MakeChoice {
            session_id: "s1".into(),
            choice: Choice::Rock,
        })
    );
    let snap = session.snapshot();
    assert!(snap.has_made_choice);
    assert_eq!(snap.my_choice, ChoiceSlot::Chosen(Choice::Rock));
    assert_eq!(snap.my_choice.glyph(), Choice::Rock.glyph());
    assert_eq!(snap.opponent_choice, ChoiceSlot::Unchosen);
}

#[tokio::test]
async fn round_result_closes_the_round() {
    let (mut session, _sink) = playing();
    session.handle_server_event(opponent_made_choice(Some("me"), 10_000));
    assert!(session.snapshot().timer.active);
    session.submit_choice(Choice::Rock);

    session.handle_server_event(win());

    let snap = session.snapshot();
    assert!(!snap.has_made_choice);
    assert_eq!(snap.your_score, 1);
    assert_eq!(snap.win_streak, 1);
    assert_eq!(snap.my_choice, ChoiceSlot::Chosen(Choice::Rock));
    assert_eq!(snap.opponent_choice, ChoiceSlot::Chosen(Choice::Scissors));
    assert!(!snap.timer.active);
}

#[tokio::test]
async fn opponent_disconnect_ends_the_match() {
    let (mut session, _sink) = playing();
    session.handle_server_event(win());
    session.handle_server_event(opponent_made_choice(Some("me"), 10_000));

    session.handle_server_event(ServerEvent::OpponentDisconnected {
        message: "Bob left".into(),
    });

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::Ended);
    let end = snap.game_end.unwrap();
    assert_eq!(end.reason, "Bob left");
    assert_eq!(end.final_scores.player, 1);
    assert_eq!(end.final_scores.opponent, Some(0));
    assert!(!snap.timer.active);
}

#[tokio::test]
async fn second_choice_in_a_round_is_ignored() {
    let (mut session, sink) = playing();
    assert!(session.submit_choice(Choice::Rock));
    let before = session.snapshot();
    let sent = sink.sent().len();

    assert!(!session.submit_choice(Choice::Paper));

    assert_eq!(session.snapshot(), before);
    assert_eq!(sink.sent().len(), sent);
}

// ════════════════════════════════════════════════════════════════════
// Choice guards
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn submit_choice_outside_playing_is_a_noop() {
    let (mut session, sink) = new_session();
    assert!(!session.submit_choice(Choice::Rock));

    session.start(StartParams::new("alice"));
    session.handle_server_event(match_found("s1", "bob", "alice"));
    let before = session.snapshot();
    let sent = sink.sent().len();

    assert!(!session.submit_choice(Choice::Rock));
    assert_eq!(session.snapshot(), before);
    assert_eq!(sink.sent().len(), sent);
}

#[tokio::test]
async fn submit_choice_while_offline_is_a_noop() {
    let (mut session, sink) = playing();
    sink.set_connected(false);

    assert!(!session.submit_choice(Choice::Scissors));
    assert!(!session.has_made_choice());
}

#[tokio::test]
async fn choice_flag_tracks_submit_until_result() {
    let (mut session, _sink) = playing();

    for result in [win(), loss(), tie()] {
        assert!(!session.has_made_choice());
        assert!(session.submit_choice(Choice::Rock));
        session.handle_server_event(ServerEvent::ChoiceRegistered {
            message: String::new(),
        });
        session.handle_server_event(opponent_made_choice(None, 0));
        assert!(session.has_made_choice());
        session.handle_server_event(result);
        assert!(!session.has_made_choice());
    }
}

// ════════════════════════════════════════════════════════════════════
// Streaks and scores
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn streak_counts_wins_and_resets_on_loss() {
    let (mut session, _sink) = playing();

    for event in [win(), win(), win(), tie(), loss(), win()] {
        session.handle_server_event(event);
    }

    let snap = session.snapshot();
    assert_eq!(snap.win_streak, 1);
    assert_eq!(snap.longest_streak, 3);
}

#[tokio::test]
async fn scores_come_from_the_server() {
    let (mut session, _sink) = playing();
    session.handle_server_event(round_result(
        Some(Choice::Paper),
        Some(Choice::Rock),
        "You won!",
        (4, 7),
    ));

    let snap = session.snapshot();
    assert_eq!(snap.your_score, 4);
    assert_eq!(snap.opponent_score, Some(7));
}

#[tokio::test]
async fn round_results_apply_coin_deltas() {
    let (mut session, _sink) = playing();
    session.handle_server_event(win());
    session.handle_server_event(tie());
    session.handle_server_event(loss());

    assert_eq!(
        session.take_effects(),
        vec![SideEffect::ApplyCoinDelta(10), SideEffect::ApplyCoinDelta(-10)]
    );
}

// ════════════════════════════════════════════════════════════════════
// Turn timer
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn restarted_timer_replaces_the_previous_countdown() {
    let (mut session, _sink) = playing();
    session.handle_server_event(opponent_made_choice(Some("me"), 10_000));
    tokio::time::sleep(Duration::from_secs(4)).await;

    session.handle_server_event(opponent_made_choice(Some("me"), 5_000));
    let timer = session.snapshot().timer;
    assert!(timer.active);
    assert_eq!(timer.duration, Duration::from_secs(5));

    tokio::time::sleep(Duration::from_millis(5_200)).await;
    let timer = session.snapshot().timer;
    assert!(timer.expired);
    assert_eq!(timer.remaining, Duration::ZERO);
}

#[tokio::test]
async fn timer_for_the_opponent_is_not_started() {
    let (mut session, _sink) = playing();
    session.handle_server_event(opponent_made_choice(Some("someone-else"), 10_000));
    assert!(!session.snapshot().timer.active);
}

// ════════════════════════════════════════════════════════════════════
// Reset
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reset_to_start_is_idempotent() {
    let (mut session, _sink) = playing();
    session.handle_server_event(opponent_made_choice(Some("me"), 10_000));
    session.submit_choice(Choice::Paper);

    session.reset_to_start(None);
    let once = session.snapshot();
    session.reset_to_start(None);
    let twice = session.snapshot();

    assert_eq!(once, twice);
    assert_eq!(once.phase, Phase::Idle);
    assert_eq!(once.session_id, None);
    assert!(!once.has_made_choice);
    assert!(!once.timer.active);
}

#[tokio::test]
async fn reset_while_searching_cancels_matchmaking() {
    let (mut session, sink) = new_session();
    session.start(StartParams::new("alice"));

    session.reset_to_start(Some("Back to start.".into()));

    assert_eq!(session.phase(), Phase::Idle);
    assert_eq!(sink.sent().last(), Some(&ClientCommand::CancelMatchmaking));
    assert_eq!(session.snapshot().user_message, "Back to start.");
}

#[tokio::test]
async fn cancel_search_waits_for_server_confirmation() {
    let (mut session, sink) = new_session();
    session.start(StartParams::new("alice"));

    session.cancel_search();
    assert_eq!(session.phase(), Phase::Searching);
    assert_eq!(sink.sent().last(), Some(&ClientCommand::CancelMatchmaking));

    session.handle_server_event(ServerEvent::MatchmakingCancelled {
        message: String::new(),
    });
    assert_eq!(session.phase(), Phase::Idle);
}

#[tokio::test]
async fn insufficient_coins_returns_to_idle_with_message() {
    let (mut session, _sink) = new_session();
    session.start(StartParams::new("alice"));

    session.handle_server_event(ServerEvent::MatchmakingFailedInsufficientCoins {
        message: String::new(),
        required: 10,
        current_balance: 3,
    });

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::Idle);
    assert!(snap.user_message.contains("10"));
    assert!(snap.user_message.contains('3'));
}

// ════════════════════════════════════════════════════════════════════
// Game end and replay
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn play_again_after_end_returns_to_idle() {
    let (mut session, _sink) = playing();
    session.end_game();
    assert_eq!(session.phase(), Phase::Ended);

    session.play_again();

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::Idle);
    assert!(snap.game_end.is_none());
}

#[tokio::test]
async fn play_again_refused_when_server_forbids_it() {
    let (mut session, _sink) = playing();
    session.handle_server_event(ServerEvent::GameEndedInsufficientFunds(Box::new(
        rps_match_client::protocol::InsufficientFundsPayload {
            message: "You are out of coins.".into(),
            can_continue: false,
            session: Default::default(),
        },
    )));
    assert_eq!(session.phase(), Phase::Ended);

    session.play_again();
    assert_eq!(session.phase(), Phase::Ended);
    assert!(!session.snapshot().game_end.unwrap().can_play_again);
}

#[tokio::test]
async fn reaction_is_sent_only_while_playing() {
    let (mut session, sink) = new_session();
    session.start(StartParams::new("alice"));
    session.handle_server_event(match_found("s1", "bob", "alice"));

    session.submit_reaction("gg");
    assert_eq!(sink.sent().len(), 1);

    session.advance(Instant::now() + Duration::from_secs(60));
    session.submit_reaction("gg");
    assert_eq!(
        sink.sent().last(),
        Some(&ClientCommand::MakeReaction {
            session_id: "s1".into(),
            reaction: "gg".into(),
        })
    );

    session.end_game();
    let sent = sink.sent().len();
    session.submit_reaction("gg");
    assert_eq!(sink.sent().len(), sent);
}

#[tokio::test]
async fn end_game_emits_and_ends_locally() {
    let (mut session, sink) = playing();

    session.end_game();

    assert_eq!(
        sink.sent().last(),
        Some(&ClientCommand::EndGame {
            session_id: "s1".into()
        })
    );
    assert_eq!(session.phase(), Phase::Ended);
}

#[tokio::test]
async fn round_events_after_end_are_ignored() {
    let (mut session, _sink) = playing();
    session.end_game();
    let before = session.snapshot();

    session.handle_server_event(win());
    session.handle_server_event(opponent_made_choice(Some("me"), 10_000));

    assert_eq!(session.snapshot(), before);
}

// ════════════════════════════════════════════════════════════════════
// Reconnection
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn transport_drop_mid_match_resyncs_on_reconnect() {
    let (mut session, sink) = playing();
    session.submit_choice(Choice::Rock);

    session.handle_event(MatchEvent::Disconnected {
        reason: Some("reset".into()),
        origin: DisconnectOrigin::Transport,
    });
    assert_eq!(session.phase(), Phase::Playing);

    session.handle_event(MatchEvent::Connected);
    assert_eq!(
        sink.sent().last(),
        Some(&ClientCommand::Resync {
            session_id: "s1".into()
        })
    );

    session.handle_server_event(ServerEvent::SessionInvalid {
        message: String::new(),
    });
    assert_eq!(session.phase(), Phase::Ended);
}

#[tokio::test]
async fn connection_lost_while_searching_returns_to_idle() {
    let (mut session, sink) = new_session();
    session.start(StartParams::new("alice"));

    sink.set_connected(false);
    session.handle_event(MatchEvent::Disconnected {
        reason: Some("reset".into()),
        origin: DisconnectOrigin::Transport,
    });

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::Idle);
    assert!(snap.user_message.contains("Connection lost while searching"));

    sink.set_connected(true);
    session.handle_event(MatchEvent::Connected);
    assert_eq!(sink.sent().len(), 1);
    assert!(matches!(sink.sent()[0], ClientCommand::Start { .. }));
}

#[tokio::test]
async fn client_disconnect_while_searching_keeps_phase() {
    let (mut session, _sink) = new_session();
    session.start(StartParams::new("alice"));

    session.handle_event(MatchEvent::Disconnected {
        reason: Some("client disconnected".into()),
        origin: DisconnectOrigin::Client,
    });
    assert_eq!(session.phase(), Phase::Searching);
}

// ════════════════════════════════════════════════════════════════════
// Informational and error events
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn error_occurred_stops_timer_and_keeps_phase() {
    let (mut session, _sink) = playing();
    session.handle_server_event(opponent_made_choice(Some("me"), 10_000));
    assert!(session.snapshot().timer.active);

    session.handle_server_event(ServerEvent::ErrorOccurred {
        message: "Invalid choice".into(),
    });

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::Playing);
    assert_eq!(snap.user_message, "Error: Invalid choice");
    assert!(!snap.timer.active);
}

#[tokio::test]
async fn already_in_session_resets_to_start() {
    let (mut session, sink) = new_session();
    session.start(StartParams::new("alice"));

    session.handle_server_event(ServerEvent::AlreadyInSession {
        message: "You are already in a game session.".into(),
    });

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::Idle);
    assert_eq!(snap.user_message, "You are already in a game session.");
    assert_eq!(sink.sent().last(), Some(&ClientCommand::CancelMatchmaking));
}

#[tokio::test]
async fn system_error_during_matchmaking_resets_to_start() {
    let (mut session, _sink) = new_session();
    session.start(StartParams::new("alice"));

    session.handle_server_event(ServerEvent::MatchmakingFailedSystemError {
        message: "Matchmaking is unavailable.".into(),
    });

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::Idle);
    assert_eq!(snap.user_message, "Matchmaking is unavailable.");
    assert!(snap.round_status.is_empty());
}

#[tokio::test]
async fn not_in_queue_only_sets_the_message() {
    let (mut session, _sink) = new_session();
    session.start(StartParams::new("alice"));

    session.handle_server_event(ServerEvent::NotInQueue {
        message: "You are not in the queue.".into(),
    });

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::Searching);
    assert_eq!(snap.user_message, "You are not in the queue.");
}

#[tokio::test]
async fn cannot_cancel_in_game_only_sets_the_message() {
    let (mut session, _sink) = playing();

    session.handle_server_event(ServerEvent::CannotCancelInGame {
        message: "Cannot cancel during a game.".into(),
    });

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::Playing);
    assert_eq!(snap.session_id.as_deref(), Some("s1"));
    assert_eq!(snap.user_message, "Cannot cancel during a game.");
}

#[tokio::test]
async fn forfeit_notices_update_round_status() {
    let (mut session, _sink) = playing();

    session.handle_server_event(ServerEvent::OpponentForfeitCoins {
        message: "Opponent forfeited 10 coins.".into(),
    });
    assert_eq!(session.snapshot().round_status, "Opponent forfeited 10 coins.");

    session.handle_server_event(ServerEvent::ForfeitCoins {
        message: "You forfeited 10 coins.".into(),
    });
    let snap = session.snapshot();
    assert_eq!(snap.round_status, "You forfeited 10 coins.");
    assert_eq!(snap.phase, Phase::Playing);
}

#[tokio::test]
async fn server_cancel_mid_match_returns_to_idle() {
    let (mut session, _sink) = new_session();
    session.start(StartParams::new("alice"));
    session.handle_server_event(match_found("s1", "bob", "alice"));
    assert_eq!(session.phase(), Phase::OpponentFound);

    session.handle_server_event(ServerEvent::MatchmakingCancelled {
        message: String::new(),
    });

    let snap = session.snapshot();
    assert_eq!(snap.phase, Phase::Idle);
    assert_eq!(snap.session_id, None);
    assert_eq!(snap.user_message, "Matchmaking cancelled.");
    assert_eq!(session.next_deadline(), None);
}

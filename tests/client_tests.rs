#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for `MatchClient` using scripted transports.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use rps_match_client::protocol::{Choice, ClientCommand, ServerEvent};
use rps_match_client::{
    CommandSink, DisconnectOrigin, MatchClient, MatchConfig, MatchError, MatchEvent,
};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

fn config() -> MatchConfig {
    MatchConfig::new("ws://test.invalid/ws")
        .with_reconnection_attempts(2)
        .with_reconnection_delay(Duration::from_secs(1))
}

fn start_client(
    dials: Vec<Dial>,
    config: MatchConfig,
) -> (MatchClient, mpsc::Receiver<MatchEvent>, Probe) {
    let (connector, probe) = MockConnector::new(dials);
    let (client, events) = MatchClient::start(connector, config);
    (client, events, probe)
}

async fn next_event(rx: &mut mpsc::Receiver<MatchEvent>) -> MatchEvent {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_for_sent(probe: &Probe, count: usize) {
    for _ in 0..100 {
        if probe.sent.lock().unwrap().len() >= count {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("expected {count} sent frame(s)");
}

fn accepted_event(id: &str) -> MatchEvent {
    MatchEvent::Server(ServerEvent::ConnectionAccepted {
        connection_id: id.into(),
    })
}

// ════════════════════════════════════════════════════════════════════
// Connection lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn connects_and_records_connection_id() {
    let (client, mut rx, probe) =
        start_client(vec![Dial::Accept(vec![frame(accepted_json("c1"))])], config());

    assert_eq!(next_event(&mut rx).await, MatchEvent::Connected);
    assert_eq!(next_event(&mut rx).await, accepted_event("c1"));
    assert!(client.is_connected());
    assert_eq!(client.connection_id().as_deref(), Some("c1"));
    assert_eq!(probe.attempts(), 1);
}

#[tokio::test]
async fn handle_reports_connection_through_command_sink() {
    let (client, mut rx, _probe) =
        start_client(vec![Dial::Accept(vec![frame(accepted_json("c9"))])], config());
    let handle = client.handle();

    next_event(&mut rx).await;
    next_event(&mut rx).await;

    assert!(CommandSink::is_connected(&handle));
    assert_eq!(CommandSink::connection_id(&handle).as_deref(), Some("c9"));
    assert!(!handle.has_given_up());
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let (_client, mut rx, _probe) = start_client(
        vec![Dial::Accept(vec![
            frame("not json".into()),
            frame(r#"{"event":"teleport","data":{}}"#.into()),
            frame(accepted_json("c2")),
        ])],
        config(),
    );

    assert_eq!(next_event(&mut rx).await, MatchEvent::Connected);
    assert_eq!(next_event(&mut rx).await, accepted_event("c2"));
}

#[tokio::test]
async fn server_events_arrive_in_wire_order() {
    let found = match_found("s1", "bob", "alice");
    let (_client, mut rx, _probe) = start_client(
        vec![Dial::Accept(vec![
            frame(accepted_json("c1")),
            frame(json(&found)),
            frame(json(&opponent_made_choice(Some("c1"), 10_000))),
        ])],
        config(),
    );

    assert_eq!(next_event(&mut rx).await, MatchEvent::Connected);
    assert_eq!(next_event(&mut rx).await, accepted_event("c1"));
    assert_eq!(next_event(&mut rx).await, MatchEvent::Server(found));
    assert!(matches!(
        next_event(&mut rx).await,
        MatchEvent::Server(ServerEvent::OpponentMadeChoice { .. })
    ));
}

// ════════════════════════════════════════════════════════════════════
// Commands
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn emit_sends_wire_json() {
    let (client, mut rx, probe) = start_client(vec![Dial::Accept(vec![])], config());
    assert_eq!(next_event(&mut rx).await, MatchEvent::Connected);

    assert_ok!(client.emit(ClientCommand::MakeChoice {
        session_id: "s1".into(),
        choice: Choice::Paper,
    }));
    wait_for_sent(&probe, 1).await;

    let sent = probe.sent_json();
    assert_eq!(sent[0]["event"], "make_choice");
    assert_eq!(sent[0]["data"]["sessionId"], "s1");
    assert_eq!(sent[0]["data"]["choice"], "paper");
}

#[tokio::test]
async fn commands_keep_their_order() {
    let (client, mut rx, probe) = start_client(vec![Dial::Accept(vec![])], config());
    next_event(&mut rx).await;

    let handle = client.handle();
    assert_ok!(handle.emit(ClientCommand::Start {
        username: "alice".into(),
        user_id: None,
        group_owner: None,
    }));
    assert_ok!(handle.emit(ClientCommand::CancelMatchmaking));
    wait_for_sent(&probe, 2).await;

    assert_eq!(probe.sent_events(), vec!["start", "cancel_matchmaking"]);
}

#[tokio::test]
async fn emit_before_connection_is_rejected() {
    let (client, _rx, probe) = start_client(vec![Dial::Accept(vec![])], config());

    let result = client.emit(ClientCommand::CancelMatchmaking);
    assert!(matches!(result, Err(MatchError::NotConnected)));
    assert!(probe.sent.lock().unwrap().is_empty());
}

// ════════════════════════════════════════════════════════════════════
// Reconnection
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn server_close_reconnects_immediately() {
    let (client, mut rx, probe) = start_client(
        vec![
            Dial::Accept(vec![frame(accepted_json("a")), None]),
            Dial::Accept(vec![frame(accepted_json("b"))]),
        ],
        config(),
    );

    assert_eq!(next_event(&mut rx).await, MatchEvent::Connected);
    assert_eq!(next_event(&mut rx).await, accepted_event("a"));

    let closed_at = tokio::time::Instant::now();
    assert!(matches!(
        next_event(&mut rx).await,
        MatchEvent::Disconnected {
            origin: DisconnectOrigin::Server,
            ..
        }
    ));
    assert_eq!(next_event(&mut rx).await, MatchEvent::Connected);
    assert!(closed_at.elapsed() < Duration::from_secs(1));

    assert_eq!(next_event(&mut rx).await, accepted_event("b"));
    assert_eq!(client.connection_id().as_deref(), Some("b"));
    assert_eq!(probe.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn transport_error_reconnects_after_delay() {
    let (client, mut rx, probe) = start_client(
        vec![
            Dial::Accept(vec![Some(Err(MatchError::TransportReceive(
                "reset by peer".into(),
            )))]),
            Dial::Accept(vec![]),
        ],
        config(),
    );

    assert_eq!(next_event(&mut rx).await, MatchEvent::Connected);
    match next_event(&mut rx).await {
        MatchEvent::Disconnected { reason, origin } => {
            assert_eq!(origin, DisconnectOrigin::Transport);
            assert!(reason.unwrap().contains("reset by peer"));
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
    assert!(!client.is_connected());

    let lost_at = tokio::time::Instant::now();
    assert_eq!(next_event(&mut rx).await, MatchEvent::Connected);
    assert!(lost_at.elapsed() >= Duration::from_secs(1));
    assert_eq!(probe.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn budget_exhaustion_waits_for_manual_reconnect() {
    let (client, mut rx, probe) = start_client(
        vec![
            Dial::Refuse("down"),
            Dial::Refuse("down"),
            Dial::Refuse("down"),
            Dial::Accept(vec![frame(accepted_json("late"))]),
        ],
        config(),
    );

    for _ in 0..2 {
        assert!(matches!(
            next_event(&mut rx).await,
            MatchEvent::ConnectionFailed {
                will_retry: true,
                ..
            }
        ));
    }
    match next_event(&mut rx).await {
        MatchEvent::ConnectionFailed { reason, will_retry } => {
            assert!(!will_retry);
            assert!(reason.contains("3 attempt"));
        }
        other => panic!("expected final ConnectionFailed, got {other:?}"),
    }
    assert!(client.handle().has_given_up());
    assert_eq!(probe.attempts(), 3);

    // Parked: no further dials however long we wait.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(probe.attempts(), 3);

    assert_ok!(client.reconnect());
    assert_eq!(next_event(&mut rx).await, MatchEvent::Connected);
    assert_eq!(next_event(&mut rx).await, accepted_event("late"));
    assert!(!client.handle().has_given_up());
    assert_eq!(probe.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn manual_reconnect_cuts_backoff_short() {
    let (client, mut rx, probe) = start_client(
        vec![Dial::Refuse("down"), Dial::Accept(vec![])],
        config().with_reconnection_delay(Duration::from_secs(60)),
    );

    assert!(matches!(
        next_event(&mut rx).await,
        MatchEvent::ConnectionFailed {
            will_retry: true,
            ..
        }
    ));

    let asked_at = tokio::time::Instant::now();
    assert_ok!(client.reconnect());
    assert_eq!(next_event(&mut rx).await, MatchEvent::Connected);
    assert!(asked_at.elapsed() < Duration::from_secs(60));
    assert_eq!(probe.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn zero_retries_gives_up_after_first_failure() {
    let (client, mut rx, probe) = start_client(
        vec![Dial::Refuse("down")],
        config().with_reconnection_attempts(0),
    );

    assert!(matches!(
        next_event(&mut rx).await,
        MatchEvent::ConnectionFailed {
            will_retry: false,
            ..
        }
    ));
    assert!(client.handle().has_given_up());
    assert_eq!(probe.attempts(), 1);
}

// ════════════════════════════════════════════════════════════════════
// Shutdown
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn disconnect_closes_without_reconnecting() {
    let (mut client, mut rx, probe) =
        start_client(vec![Dial::Accept(vec![]), Dial::Accept(vec![])], config());
    assert_eq!(next_event(&mut rx).await, MatchEvent::Connected);

    client.disconnect().await;

    assert!(matches!(
        next_event(&mut rx).await,
        MatchEvent::Disconnected {
            origin: DisconnectOrigin::Client,
            ..
        }
    ));
    // Loop exited: the event sender is gone.
    assert!(rx.recv().await.is_none());
    assert!(probe.closed.load(Ordering::Relaxed));
    assert!(!client.is_connected());
    assert_eq!(client.connection_id(), None);
    assert_eq!(probe.attempts(), 1);
}

#[tokio::test]
async fn emit_after_disconnect_is_rejected() {
    let (mut client, mut rx, _probe) = start_client(vec![Dial::Accept(vec![])], config());
    next_event(&mut rx).await;

    client.disconnect().await;

    let err = assert_err!(client.emit(ClientCommand::CancelMatchmaking));
    assert!(matches!(err, MatchError::NotConnected));
}

#[tokio::test]
async fn disconnect_twice_is_harmless() {
    let (mut client, mut rx, _probe) = start_client(vec![Dial::Accept(vec![])], config());
    next_event(&mut rx).await;

    client.disconnect().await;
    client.disconnect().await;
    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_backoff_stops_dialing() {
    let (mut client, mut rx, probe) = start_client(
        vec![Dial::Refuse("down"), Dial::Accept(vec![])],
        config().with_reconnection_delay(Duration::from_secs(30)),
    );

    assert!(matches!(
        next_event(&mut rx).await,
        MatchEvent::ConnectionFailed { .. }
    ));
    client.disconnect().await;

    assert!(rx.recv().await.is_none());
    assert_eq!(probe.attempts(), 1);
}

#[tokio::test]
async fn dropping_client_stops_the_loop() {
    let (client, mut rx, _probe) = start_client(vec![Dial::Accept(vec![])], config());
    assert_eq!(next_event(&mut rx).await, MatchEvent::Connected);

    drop(client);

    let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("loop should stop after drop");
    assert!(closed.is_none());
}

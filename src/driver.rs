//! Composition root: one task that owns the session and feeds it.
//!
//! [`GameDriver::run`] multiplexes connection events, user actions, local
//! deadlines, turn timer ticks and finished profile fetches with
//! `tokio::select!`. After every step it executes the session's queued side
//! effects and publishes a fresh [`GameView`] on a `watch` channel.
//!
//! ```rust,ignore
//! let (client, events) = MatchClient::connect(MatchConfig::from_env());
//! let session = Session::new(client.handle(), SessionConfig::default());
//! let profiles = ProfileResolver::new(Arc::new(HttpBackend::from_server_url(&url)?));
//! let (driver, mut views) = GameDriver::new(session, profiles);
//! let (actions_tx, actions_rx) = mpsc::channel(16);
//! tokio::spawn(driver.run(events, actions_rx));
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::BackendApi;
use crate::event::MatchEvent;
use crate::profile::{fetch_profile, ProfileFetch, ProfileResolver, UserProfile};
use crate::protocol::Choice;
use crate::session::{CommandSink, Phase, Session, SessionSnapshot, SideEffect, StartParams};

/// A local user intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    Start(StartParams),
    Choose(Choice),
    React(String),
    EndGame,
    CancelSearch,
    PlayAgain,
    /// Return to the start screen from anywhere.
    BackToStart,
    /// Retry the connection after the reconnection budget ran out.
    Reconnect,
}

/// Everything a renderer needs, published after every step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GameView {
    pub session: SessionSnapshot,
    pub user_profile: Option<UserProfile>,
    pub opponent_profile: Option<UserProfile>,
}

/// Owns a [`Session`] and a [`ProfileResolver`] and drives them from channels.
pub struct GameDriver<S, A> {
    session: Session<S>,
    profiles: ProfileResolver<A>,
    view_tx: watch::Sender<GameView>,
    fetches: JoinSet<ProfileFetch>,
}

impl<S, A> GameDriver<S, A>
where
    S: CommandSink,
    A: BackendApi,
{
    /// Create a driver and the receiver its views are published on.
    pub fn new(
        session: Session<S>,
        profiles: ProfileResolver<A>,
    ) -> (Self, watch::Receiver<GameView>) {
        let (view_tx, view_rx) = watch::channel(GameView::default());
        let mut driver = Self {
            session,
            profiles,
            view_tx,
            fetches: JoinSet::new(),
        };
        driver.publish();
        (driver, view_rx)
    }

    pub fn session(&self) -> &Session<S> {
        &self.session
    }

    pub fn profiles(&self) -> &ProfileResolver<A> {
        &self.profiles
    }

    /// Current view, built on demand.
    pub fn view(&self) -> GameView {
        GameView {
            session: self.session.snapshot(),
            user_profile: self.profiles.user().cloned(),
            opponent_profile: self.profiles.opponent().cloned(),
        }
    }

    /// Run until either input channel closes. Returns the driver for inspection.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<MatchEvent>,
        mut actions: mpsc::Receiver<UserAction>,
    ) -> Self {
        debug!("game driver started");
        let mut timer_rx = self.session.timer_updates();

        loop {
            self.execute_effects();
            self.publish();

            let deadline = self.session.next_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.session.handle_event(event),
                    None => {
                        debug!("event stream closed");
                        break;
                    }
                },
                action = actions.recv() => match action {
                    Some(action) => self.apply(action),
                    None => {
                        debug!("action stream closed");
                        break;
                    }
                },
                () = sleep_until(deadline) => self.session.advance(Instant::now()),
                Ok(()) = timer_rx.changed() => {}
                Some(joined) = self.fetches.join_next(), if !self.fetches.is_empty() => {
                    match joined {
                        Ok(fetch) => {
                            self.profiles.complete(fetch);
                        }
                        Err(e) => warn!("profile fetch task failed: {e}"),
                    }
                }
            }
        }

        self.fetches.abort_all();
        self.execute_effects();
        self.publish();
        debug!("game driver exited");
        self
    }

    /// Apply one user action to the session.
    pub fn apply(&mut self, action: UserAction) {
        debug!(?action, "user action");
        match action {
            UserAction::Start(params) => self.session.start(params),
            UserAction::Choose(choice) => {
                if !self.session.submit_choice(choice) {
                    debug!(%choice, "choice not accepted");
                }
            }
            UserAction::React(reaction) => self.session.submit_reaction(reaction),
            UserAction::EndGame => self.session.end_game(),
            UserAction::CancelSearch => self.session.cancel_search(),
            UserAction::PlayAgain => self.session.play_again(),
            UserAction::BackToStart => self.session.reset_to_start(None),
            UserAction::Reconnect => self.session.sink().request_reconnect(),
        }
    }

    fn execute_effects(&mut self) {
        // Back on the start screen there is no opponent to show.
        if self.session.phase() == Phase::Idle {
            self.profiles.clear_opponent();
        }

        for effect in self.session.take_effects() {
            match effect {
                SideEffect::FetchProfile { username, role } => {
                    self.profiles.assign(&username, role);
                    self.fetches
                        .spawn(fetch_profile(self.profiles.backend(), username, role));
                }
                SideEffect::ApplyCoinDelta(delta) => {
                    if self.profiles.apply_coin_delta(delta).is_none() {
                        debug!(delta, "no cached profile for coin delta");
                    }
                }
                SideEffect::SubmitScore(submission) => {
                    let backend: Arc<A> = self.profiles.backend();
                    tokio::spawn(async move {
                        match backend.submit_score(&submission).await {
                            Ok(()) => info!(
                                user_id = submission.user_id,
                                score = submission.score,
                                "score submitted"
                            ),
                            Err(e) => error!("score submission failed: {e}"),
                        }
                    });
                }
            }
        }
    }

    fn publish(&mut self) {
        let view = self.view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

impl<S, A> std::fmt::Debug for GameDriver<S, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameDriver")
            .field("session", &self.session)
            .field("profiles", &self.profiles)
            .field("pending_fetches", &self.fetches.len())
            .finish()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
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
    use crate::backend::ScoreSubmission;
    use crate::error::{MatchError, Result};
    use crate::protocol::{ClientCommand, RoundResultPayload, RoundScores, ServerEvent};
    use crate::session::SessionConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<ClientCommand>>>,
    }

    impl CommandSink for Recorder {
        fn is_connected(&self) -> bool {
            true
        }

        fn connection_id(&self) -> Option<String> {
            Some("me".into())
        }

        fn emit(&self, command: ClientCommand) -> Result<()> {
            self.sent.lock().unwrap().push(command);
            Ok(())
        }

        fn request_reconnect(&self) {}
    }

    #[derive(Default)]
    struct StubBackend {
        profiles: HashMap<String, i64>,
        scores: Mutex<Vec<ScoreSubmission>>,
    }

    #[async_trait]
    impl BackendApi for StubBackend {
        async fn fetch_profile(
            &self,
            username: &str,
        ) -> std::result::Result<Option<UserProfile>, MatchError> {
            Ok(self.profiles.get(username).map(|coins| UserProfile {
                username: username.to_string(),
                coins: *coins,
                ..UserProfile::default()
            }))
        }

        async fn submit_score(
            &self,
            submission: &ScoreSubmission,
        ) -> std::result::Result<(), MatchError> {
            self.scores.lock().unwrap().push(submission.clone());
            Ok(())
        }
    }

    fn won_round() -> MatchEvent {
        MatchEvent::Server(ServerEvent::RoundResult(Box::new(RoundResultPayload {
            your_choice: Some(Choice::Paper),
            opponent_choice: Some(Choice::Rock),
            result: "You won!".into(),
            reason: None,
            scores: RoundScores {
                current_player: 1,
                opponent: 0,
            },
        })))
    }

    #[tokio::test(start_paused = true)]
    async fn full_match_flow_publishes_views() {
        let sink = Recorder::default();
        let backend = Arc::new(StubBackend {
            profiles: HashMap::from([("alice".to_string(), 100), ("bob".to_string(), 40)]),
            ..StubBackend::default()
        });
        let session = Session::new(sink.clone(), SessionConfig::default());
        let (driver, mut views) = GameDriver::new(session, ProfileResolver::new(Arc::clone(&backend)));

        let (event_tx, event_rx) = mpsc::channel(16);
        let (action_tx, action_rx) = mpsc::channel(16);
        let task = tokio::spawn(driver.run(event_rx, action_rx));

        event_tx.send(MatchEvent::Connected).await.unwrap();
        action_tx
            .send(UserAction::Start(StartParams::new("alice").with_user_id(42)))
            .await
            .unwrap();
        views
            .wait_for(|v| v.session.phase == Phase::Searching)
            .await
            .unwrap();

        event_tx
            .send(MatchEvent::Server(ServerEvent::MatchFound {
                session_id: "s1".into(),
                opponent: "bob".into(),
                your_username: "alice".into(),
            }))
            .await
            .unwrap();

        // Opponent-found pause and joining countdown run on local deadlines.
        let view = views
            .wait_for(|v| v.session.phase == Phase::Playing)
            .await
            .unwrap()
            .clone();
        assert_eq!(view.session.joining_countdown, 0);
        assert_eq!(view.opponent_profile.unwrap().coins, 40);

        action_tx.send(UserAction::Choose(Choice::Paper)).await.unwrap();
        views
            .wait_for(|v| v.session.has_made_choice)
            .await
            .unwrap();
        event_tx.send(won_round()).await.unwrap();
        let view = views
            .wait_for(|v| v.session.your_score == 1)
            .await
            .unwrap()
            .clone();
        assert_eq!(view.user_profile.unwrap().coins, 110);
        assert_eq!(view.session.coin_change, 10);

        action_tx.send(UserAction::EndGame).await.unwrap();
        views
            .wait_for(|v| v.session.phase == Phase::Ended)
            .await
            .unwrap();

        drop(event_tx);
        let driver = task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(driver.session().phase(), Phase::Ended);
        assert_eq!(
            backend.scores.lock().unwrap().as_slice(),
            &[ScoreSubmission {
                client_inline_message_id: None,
                user_id: 42,
                score: 1,
            }]
        );
        let sent = sink.sent.lock().unwrap();
        assert!(matches!(sent[0], ClientCommand::Start { .. }));
        assert!(matches!(sent[1], ClientCommand::MakeChoice { .. }));
        assert!(matches!(sent[2], ClientCommand::EndGame { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn returning_to_start_forgets_the_opponent() {
        let backend = Arc::new(StubBackend {
            profiles: HashMap::from([("alice".to_string(), 100), ("bob".to_string(), 40)]),
            ..StubBackend::default()
        });
        let session = Session::new(Recorder::default(), SessionConfig::default());
        let (driver, mut views) = GameDriver::new(session, ProfileResolver::new(backend));

        let (event_tx, event_rx) = mpsc::channel(16);
        let (action_tx, action_rx) = mpsc::channel(16);
        let task = tokio::spawn(driver.run(event_rx, action_rx));

        action_tx
            .send(UserAction::Start(StartParams::new("alice")))
            .await
            .unwrap();
        views
            .wait_for(|v| v.session.phase == Phase::Searching)
            .await
            .unwrap();
        event_tx
            .send(MatchEvent::Server(ServerEvent::MatchFound {
                session_id: "s1".into(),
                opponent: "bob".into(),
                your_username: "alice".into(),
            }))
            .await
            .unwrap();
        views
            .wait_for(|v| v.opponent_profile.is_some() && v.user_profile.is_some())
            .await
            .unwrap();

        action_tx.send(UserAction::BackToStart).await.unwrap();
        let view = views
            .wait_for(|v| v.session.phase == Phase::Idle)
            .await
            .unwrap()
            .clone();
        assert!(view.opponent_profile.is_none());
        assert_eq!(view.user_profile.unwrap().coins, 100);

        drop(action_tx);
        let driver = task.await.unwrap();
        assert!(driver.profiles().opponent().is_none());
        assert!(driver.profiles().cached("bob").is_some());
    }

    #[tokio::test]
    async fn closing_actions_stops_the_driver() {
        let session = Session::new(Recorder::default(), SessionConfig::default());
        let (driver, _views) =
            GameDriver::new(session, ProfileResolver::new(Arc::new(StubBackend::default())));
        let (_event_tx, event_rx) = mpsc::channel(1);
        let (action_tx, action_rx) = mpsc::channel(1);
        drop(action_tx);

        let driver = tokio::time::timeout(Duration::from_secs(1), driver.run(event_rx, action_rx))
            .await
            .unwrap();
        assert_eq!(driver.session().phase(), Phase::Idle);
    }
}

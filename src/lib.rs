//! # RPS Match Client
//!
//! Client-side protocol engine for real-time two-player rock-paper-scissors
//! matches: a reconnecting connection manager, a server-driven session state
//! machine, a local turn timer, and a cached profile resolver.
//!
//! The crate renders nothing. Frontends drive a [`Session`] with user
//! actions and render its [`SessionSnapshot`], or hand everything to a
//! [`GameDriver`] and watch the published [`GameView`]s.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any backend
//! - **WebSocket built-in**: default `transport-websocket` feature provides `WebSocketConnector`
//! - **HTTP backend built-in**: default `http-backend` feature provides `HttpBackend`
//! - **Server-authoritative**: rounds are never adjudicated locally
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rps_match_client::{
//!     GameDriver, HttpBackend, MatchClient, MatchConfig, ProfileResolver, Session,
//!     SessionConfig, StartParams, UserAction,
//! };
//!
//! let config = MatchConfig::from_env();
//! let backend = Arc::new(HttpBackend::from_server_url(&config.server_url)?);
//! let (client, events) = MatchClient::connect(config);
//!
//! let session = Session::new(client.handle(), SessionConfig::default());
//! let (driver, mut views) = GameDriver::new(session, ProfileResolver::new(backend));
//! let (actions, actions_rx) = tokio::sync::mpsc::channel(16);
//! tokio::spawn(driver.run(events, actions_rx));
//!
//! actions.send(UserAction::Start(StartParams::new("alice"))).await?;
//! while views.changed().await.is_ok() {
//!     println!("{:?}", views.borrow().session.phase);
//! }
//! ```

pub mod backend;
pub mod client;
pub mod driver;
pub mod error;
pub mod event;
pub mod launch;
pub mod profile;
pub mod protocol;
pub mod session;
pub mod timer;
pub mod transport;

#[cfg(feature = "transport-websocket")]
pub mod transports;

// Re-export primary types for ergonomic imports.
#[cfg(feature = "http-backend")]
pub use backend::HttpBackend;
pub use backend::{BackendApi, ScoreSubmission};
pub use client::{MatchClient, MatchConfig, MatchHandle};
pub use driver::{GameDriver, GameView, UserAction};
pub use error::{MatchError, Result};
pub use event::{DisconnectOrigin, MatchEvent};
pub use launch::{resolve_username, LaunchUser};
pub use profile::{ProfileResolver, UserProfile};
pub use protocol::{Choice, ClientCommand, RoundOutcome, ServerEvent};
pub use session::{
    ChoiceSlot, CommandSink, GameEndRecord, Phase, Session, SessionConfig, SessionSnapshot,
    SideEffect, StartParams,
};
pub use timer::{TimerState, TurnTimer};
pub use transport::{Connector, Transport};
#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};

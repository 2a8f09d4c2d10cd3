//! # Terminal Match Example
//!
//! Plays rock-paper-scissors against another client from the terminal:
//!
//! 1. Connect to the match server over WebSocket (with reconnection)
//! 2. Resolve profiles through the HTTP backend
//! 3. Feed typed commands to the [`GameDriver`]
//! 4. Print every published view that changed something visible
//!
//! ## Running
//!
//! ```sh
//! # Start a match server on localhost:3000, then:
//! cargo run --example terminal_match
//!
//! # Override the server URL:
//! RPS_SERVER_URL=ws://my-server:3000/ws cargo run --example terminal_match
//!
//! # Pretend to be launched from the messaging platform:
//! RPS_LAUNCH_FRAGMENT='#tgWebAppData=user%3D%257B%2522id%2522%253A1%252C%2522first_name%2522%253A%2522Ada%2522%252C%2522username%2522%253A%2522ada%2522%257D' \
//!     cargo run --example terminal_match
//! ```
//!
//! Commands: `start <name>`, `r` / `p` / `s`, `react <emoji>`, `cancel`,
//! `end`, `again`, `back`, `reconnect`, `quit`.

use std::sync::Arc;

use rps_match_client::launch::start_params;
use rps_match_client::{
    Choice, GameDriver, GameView, HttpBackend, LaunchUser, MatchClient, MatchConfig, Phase,
    ProfileResolver, Session, SessionConfig, UserAction,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const LAUNCH_FRAGMENT_ENV: &str = "RPS_LAUNCH_FRAGMENT";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let config = MatchConfig::from_env();
    let backend = Arc::new(HttpBackend::from_server_url(&config.server_url)?);
    tracing::info!(
        "match server {}, backend {}",
        config.server_url,
        backend.base_url()
    );

    let launch = match std::env::var(LAUNCH_FRAGMENT_ENV) {
        Ok(fragment) => LaunchUser::from_fragment(&fragment)?,
        Err(_) => None,
    };
    if let Some(user) = &launch {
        println!("Launched as {}", user.display_name());
    }

    // ── Wiring ──────────────────────────────────────────────────────
    let (mut client, events) = MatchClient::connect(config);
    let session = Session::new(client.handle(), SessionConfig::default());
    let (driver, mut views) = GameDriver::new(session, ProfileResolver::new(backend));
    let (actions, actions_rx) = mpsc::channel::<UserAction>(16);
    let driver_task = tokio::spawn(driver.run(events, actions_rx));

    // ── Input and rendering ─────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_line = String::new();
    print_help();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line, launch.as_ref()) {
                    Input::Action(action) => actions.send(action).await?,
                    Input::Quit => break,
                    Input::Help => print_help(),
                    Input::Unknown => println!("unknown command: {line}"),
                }
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let line = render(&views.borrow_and_update());
                if line != last_line {
                    println!("{line}");
                    last_line = line;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    drop(actions);
    client.disconnect().await;
    if let Err(e) = driver_task.await {
        tracing::warn!("driver task failed: {e}");
    }
    Ok(())
}

enum Input {
    Action(UserAction),
    Quit,
    Help,
    Unknown,
}

fn parse_command(line: &str, launch: Option<&LaunchUser>) -> Input {
    let line = line.trim();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    match word {
        "start" => match start_params(launch, rest) {
            Some(params) => Input::Action(UserAction::Start(params)),
            None => Input::Action(UserAction::Start(Default::default())),
        },
        "r" | "p" | "s" | "rock" | "paper" | "scissors" => match word.parse::<Choice>() {
            Ok(choice) => Input::Action(UserAction::Choose(choice)),
            Err(_) => Input::Unknown,
        },
        "react" if !rest.is_empty() => Input::Action(UserAction::React(rest.to_string())),
        "cancel" => Input::Action(UserAction::CancelSearch),
        "end" => Input::Action(UserAction::EndGame),
        "again" => Input::Action(UserAction::PlayAgain),
        "back" => Input::Action(UserAction::BackToStart),
        "reconnect" => Input::Action(UserAction::Reconnect),
        "quit" | "exit" => Input::Quit,
        "help" | "?" => Input::Help,
        _ => Input::Unknown,
    }
}

fn print_help() {
    println!("start <name> | r p s | react <emoji> | cancel | end | again | back | reconnect | quit");
}

fn render(view: &GameView) -> String {
    let s = &view.session;
    let coins = view
        .user_profile
        .as_ref()
        .map(|p| p.coins.to_string())
        .unwrap_or_else(|| "-".into());

    let mut line = format!("[{}] coins {coins}", s.phase);
    if s.coin_change != 0 {
        line.push_str(&format!(" ({:+})", s.coin_change));
    }

    match s.phase {
        Phase::Idle | Phase::Searching => {}
        Phase::OpponentFound => {
            let opponent = s.opponent_username.as_deref().unwrap_or("?");
            line.push_str(&format!(" | opponent found: {opponent}"));
        }
        Phase::Joining => line.push_str(&format!(" | starting in {}", s.joining_countdown)),
        Phase::Playing => {
            line.push_str(&format!(
                " | {} vs {} | score {}-{} | streak {}",
                s.my_choice.glyph(),
                s.opponent_choice.glyph(),
                s.your_score,
                s.opponent_score.unwrap_or(0),
                s.win_streak,
            ));
            if !s.round_result.is_empty() {
                line.push_str(&format!(" | {}", s.round_result));
            }
            if s.timer.active {
                line.push_str(&format!(" | {}s left", s.timer.remaining.as_secs() + 1));
            } else if s.timer.expired {
                line.push_str(" | time's up");
            }
        }
        Phase::Ended => {
            if let Some(end) = &s.game_end {
                line.push_str(&format!(
                    " | {} | final {}-{}",
                    end.reason,
                    end.final_scores.player,
                    end.final_scores.opponent.unwrap_or(0)
                ));
                if end.can_play_again {
                    line.push_str(" | type `again`");
                }
            }
        }
    }

    for message in [&s.round_status, &s.user_message, &s.connection_message] {
        if !message.is_empty() {
            line.push_str(&format!(" | {message}"));
        }
    }
    line
}

//! Restartable turn countdown.
//!
//! [`TurnTimer`] visualizes the time the local player has left to respond.
//! It is purely local: reaching zero sets [`TimerState::expired`] for display
//! but never decides a round. The outcome always arrives from the server.
//!
//! Only one countdown exists per timer. [`TurnTimer::start`] aborts the
//! previous tick task before spawning a new one, and every tick is tagged
//! with a generation so a late tick from a superseded countdown is ignored.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Tick granularity of the countdown.
pub const TURN_TIMER_TICK: Duration = Duration::from_millis(100);

/// Observable countdown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerState {
    /// `true` while the countdown is running.
    pub active: bool,
    /// Full duration of the current countdown.
    pub duration: Duration,
    /// Time left. Never exceeds `duration` and only decreases while active.
    pub remaining: Duration,
    /// Set when the countdown reached zero on its own ("time's up").
    pub expired: bool,
    generation: u64,
}

impl TimerState {
    /// `remaining / duration`, or `0.0` for a zero-length timer.
    pub fn progress(&self) -> f64 {
        if self.duration.is_zero() {
            return 0.0;
        }
        self.remaining.as_secs_f64() / self.duration.as_secs_f64()
    }
}

/// A single-owner countdown driven by a background tick task.
///
/// Must be started from within a Tokio runtime.
#[derive(Debug)]
pub struct TurnTimer {
    state: Arc<watch::Sender<TimerState>>,
    tick: Option<JoinHandle<()>>,
    period: Duration,
}

impl Default for TurnTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnTimer {
    /// Create an inactive timer ticking every [`TURN_TIMER_TICK`].
    pub fn new() -> Self {
        Self::with_tick(TURN_TIMER_TICK)
    }

    /// Create an inactive timer with a custom tick period.
    pub fn with_tick(period: Duration) -> Self {
        let (tx, _rx) = watch::channel(TimerState::default());
        Self {
            state: Arc::new(tx),
            tick: None,
            period: period.max(Duration::from_millis(1)),
        }
    }

    /// Current state.
    pub fn state(&self) -> TimerState {
        *self.state.borrow()
    }

    /// `true` while the countdown is running.
    pub fn is_active(&self) -> bool {
        self.state.borrow().active
    }

    /// Subscribe to state changes, one per tick while active.
    pub fn subscribe(&self) -> watch::Receiver<TimerState> {
        self.state.subscribe()
    }

    /// Cancel any running countdown and start a new one at full `duration`.
    pub fn start(&mut self, duration: Duration) {
        self.halt_tick();

        let generation = self.state.borrow().generation.wrapping_add(1);
        let running = !duration.is_zero();
        self.state.send_replace(TimerState {
            active: running,
            duration,
            remaining: duration,
            expired: !running,
            generation,
        });
        if !running {
            return;
        }

        debug!(duration_ms = duration.as_millis() as u64, "turn timer started");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let started = Instant::now();
                self.tick = Some(runtime.spawn(tick_loop(
                    Arc::clone(&self.state),
                    generation,
                    started,
                    self.period,
                )));
            }
            Err(_) => warn!("turn timer started outside a Tokio runtime; it will not tick"),
        }
    }

    /// Stop the countdown, keeping the last `remaining` for display.
    ///
    /// Idempotent. The tick task is released on every call.
    pub fn stop(&mut self) {
        self.halt_tick();
        self.state.send_if_modified(|state| {
            if state.active {
                state.active = false;
                true
            } else {
                false
            }
        });
    }

    /// Stop and zero out duration and remaining.
    pub fn reset(&mut self) {
        self.halt_tick();
        self.state.send_if_modified(|state| {
            let cleared = TimerState {
                generation: state.generation,
                ..TimerState::default()
            };
            if *state == cleared {
                false
            } else {
                *state = cleared;
                true
            }
        });
    }

    fn halt_tick(&mut self) {
        if let Some(tick) = self.tick.take() {
            tick.abort();
        }
    }
}

impl Drop for TurnTimer {
    fn drop(&mut self) {
        self.halt_tick();
    }
}

async fn tick_loop(
    state: Arc<watch::Sender<TimerState>>,
    generation: u64,
    started: Instant,
    period: Duration,
) {
    let mut interval = tokio::time::interval_at(started + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let mut finished = false;
        state.send_if_modified(|s| {
            // Superseded by a newer start() or already stopped.
            if s.generation != generation || !s.active {
                finished = true;
                return false;
            }
            s.remaining = s.duration.saturating_sub(started.elapsed());
            if s.remaining.is_zero() {
                s.active = false;
                s.expired = true;
                finished = true;
                debug!("turn timer expired");
            }
            true
        });

        if finished {
            break;
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::float_cmp
)]
mod tests {
    use super::*;

    /// Paused-clock deadlines land on millisecond boundaries; allow a few ms of slack.
    fn assert_near(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(
            diff <= Duration::from_millis(5),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn counts_down_in_ticks() {
        let mut timer = TurnTimer::new();
        timer.start(Duration::from_secs(1));
        assert!(timer.is_active());
        assert_eq!(timer.state().remaining, Duration::from_secs(1));
        assert_eq!(timer.state().progress(), 1.0);

        tokio::time::sleep(Duration::from_millis(350)).await;

        let state = timer.state();
        assert!(state.active);
        assert_near(state.remaining, Duration::from_millis(700));
        assert!((state.progress() - 0.7).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn reaching_zero_deactivates_and_flags_expiry() {
        let mut timer = TurnTimer::new();
        timer.start(Duration::from_millis(300));

        tokio::time::sleep(Duration::from_millis(500)).await;

        let state = timer.state();
        assert!(!state.active);
        assert!(state.expired);
        assert_eq!(state.remaining, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_supersedes_previous_countdown() {
        let mut timer = TurnTimer::new();
        timer.start(Duration::from_millis(400));
        tokio::time::sleep(Duration::from_millis(250)).await;

        timer.start(Duration::from_secs(2));
        assert_eq!(timer.state().remaining, Duration::from_secs(2));
        assert!(!timer.state().expired);

        // The first countdown would have expired by now. Ticks land at 350,
        // 450, 550 and 650 ms; waking at 700 ms sits between two of them.
        tokio::time::sleep(Duration::from_millis(450)).await;
        let state = timer.state();
        assert!(state.active);
        assert!(!state.expired);
        assert_eq!(state.duration, Duration::from_secs(2));
        assert_near(state.remaining, Duration::from_millis(1600));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_freezes_remaining() {
        let mut timer = TurnTimer::new();
        timer.stop();
        assert!(!timer.is_active());

        timer.start(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(250)).await;
        timer.stop();
        timer.stop();

        let frozen = timer.state();
        assert!(!frozen.active);
        assert!(!frozen.expired);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(timer.state(), frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_zeroes_state() {
        let mut timer = TurnTimer::new();
        timer.start(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(150)).await;

        timer.reset();
        let state = timer.state();
        assert!(!state.active);
        assert_eq!(state.duration, Duration::ZERO);
        assert_eq!(state.remaining, Duration::ZERO);
        assert_eq!(state.progress(), 0.0);

        timer.reset();
        assert_eq!(timer.state(), state);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_observe_ticks() {
        let mut timer = TurnTimer::new();
        let mut rx = timer.subscribe();
        timer.start(Duration::from_millis(200));
        let _ = rx.borrow_and_update();

        rx.changed().await.unwrap();
        assert_near(rx.borrow_and_update().remaining, Duration::from_millis(100));
        rx.changed().await.unwrap();
        let last = *rx.borrow_and_update();
        assert!(last.expired);
        assert!(!last.active);
    }

    #[tokio::test]
    async fn zero_duration_is_immediately_expired() {
        let mut timer = TurnTimer::new();
        timer.start(Duration::ZERO);
        let state = timer.state();
        assert!(!state.active);
        assert!(state.expired);
    }
}

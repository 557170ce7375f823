//! Global request pacing with automatic backoff on server distress.
//!
//! All workers share one ticker: the pacer hands out send slots spaced by
//! the current delay, so the aggregate request rate is bounded no matter
//! how many workers run (per-worker sleeps would multiply the rate by the
//! thread count). The delay itself adapts — a burst of 429/503 doubles it
//! up to a ceiling, a steady run of 2xx halves it back down to the
//! configured floor.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Outcomes tracked per response for the adaptive window.
const WINDOW: usize = 20;
/// Share of 429/503 in the window that trips a slowdown.
const DISTRESS_RATIO: f64 = 0.2;
/// Consecutive 2xx responses required before speeding back up.
const CALM_STREAK: usize = 15;

struct PacerState {
    next_slot: Instant,
    delay: Duration,
    outcomes: VecDeque<bool>,
    calm: usize,
}

pub struct Pacer {
    floor: Duration,
    ceiling: Duration,
    state: Mutex<PacerState>,
}

impl Pacer {
    /// `floor` is the configured inter-request delay (zero = unpaced until
    /// the server complains), `ceiling` caps the adaptive growth.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
            state: Mutex::new(PacerState {
                next_slot: Instant::now(),
                delay: floor,
                outcomes: VecDeque::with_capacity(WINDOW),
                calm: 0,
            }),
        }
    }

    /// Wait for the next send slot. Returns immediately while the delay is
    /// zero and no distress has been observed.
    pub async fn pace(&self) {
        let wait = {
            let mut state = self.state.lock().expect("pacer lock");
            if state.delay.is_zero() {
                return;
            }
            let now = Instant::now();
            let slot = state.next_slot.max(now);
            state.next_slot = slot + state.delay;
            slot - now
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Feed one observed status code into the adaptive window.
    // FIXME: when a 429 carries Retry-After, jump the delay straight to that
    // value instead of doubling toward it over several windows.
    pub fn observe_status(&self, status: u16) {
        let distress = status == 429 || status == 503;
        let mut state = self.state.lock().expect("pacer lock");

        state.outcomes.push_back(distress);
        while state.outcomes.len() > WINDOW {
            state.outcomes.pop_front();
        }

        if distress {
            state.calm = 0;
            let seen = state.outcomes.len();
            let bad = state.outcomes.iter().filter(|d| **d).count();
            if seen >= WINDOW / 2 && bad as f64 / seen as f64 >= DISTRESS_RATIO {
                let grown = if state.delay.is_zero() {
                    Duration::from_millis(250)
                } else {
                    state.delay * 2
                };
                let grown = grown.min(self.ceiling);
                if grown != state.delay {
                    tracing::info!(
                        delay_ms = grown.as_millis() as u64,
                        "pool.throttle.slowdown"
                    );
                    state.delay = grown;
                }
                state.outcomes.clear();
            }
        } else if (200..300).contains(&status) {
            state.calm += 1;
            if state.calm >= CALM_STREAK && state.delay > self.floor {
                let halved = (state.delay / 2).max(self.floor);
                tracing::info!(
                    delay_ms = halved.as_millis() as u64,
                    "pool.throttle.speedup"
                );
                state.delay = halved;
                state.calm = 0;
            }
        }
    }

    /// Current inter-request delay (for the progress display).
    pub fn current_delay(&self) -> Duration {
        self.state.lock().expect("pacer lock").delay
    }
}

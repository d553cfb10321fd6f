//! Adaptive Flow Control
//!
//! Decides how many records a worker may drain right now, based on how recent
//! writes went. Adapted from an adaptive token bucket: failures cut the budget
//! multiplicatively, successes grow it back.
//!
//! ## Algorithm
//!
//! - **Ceiling**: starts at `max_ceiling`.
//! - **On failure**: ceiling halves. Once it drops below one record, admission
//!   pauses (`admit` returns 0) for `pause`; afterwards a single-record probe is
//!   admitted.
//! - **On success**: ceiling doubles (up to `max_ceiling`). If the write took
//!   longer than `latency_threshold` the ceiling shrinks by a quarter instead.
//!   A window full of successes restores the full ceiling.
//! - **Failure rate**: outcomes are kept in a sliding window of `window`
//!   entries. While the failure rate exceeds `max_failure_rate`, admission is
//!   capped at half the ceiling.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    /// Largest batch ever admitted
    pub max_ceiling: usize,
    /// Writes slower than this shrink the ceiling
    pub latency_threshold: Duration,
    /// Failure fraction above which admission is halved
    pub max_failure_rate: f64,
    /// Number of recent outcomes considered for the failure rate
    pub window: usize,
    /// Admission pause once the ceiling collapses
    pub pause: Duration,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            max_ceiling: 500,
            latency_threshold: Duration::from_secs(2),
            max_failure_rate: 0.5,
            window: 20,
            pause: Duration::from_secs(5),
        }
    }
}

struct FlowState {
    ceiling: f64,
    /// true = success
    outcomes: VecDeque<bool>,
    paused_until: Option<Instant>,
}

impl FlowState {
    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }
}

pub struct FlowControl {
    config: FlowControlConfig,
    state: Mutex<FlowState>,
}

impl FlowControl {
    pub fn new(config: FlowControlConfig) -> Self {
        let ceiling = config.max_ceiling.max(1) as f64;
        Self {
            state: Mutex::new(FlowState {
                ceiling,
                outcomes: VecDeque::with_capacity(config.window),
                paused_until: None,
            }),
            config,
        }
    }

    /// Number of records the caller may take, at most `requested`
    pub async fn admit(&self, requested: usize) -> usize {
        if requested == 0 {
            return 0;
        }

        let mut state = self.state.lock().await;

        if let Some(until) = state.paused_until {
            if Instant::now() < until {
                return 0;
            }
            // Pause over, probe with a single record
            state.paused_until = None;
            state.ceiling = 1.0;
            return 1;
        }

        let mut allowed = state.ceiling.floor().max(1.0) as usize;
        if state.failure_rate() > self.config.max_failure_rate {
            allowed = (allowed / 2).max(1);
        }
        allowed.min(requested)
    }

    pub async fn record_success(&self, latency: Duration) {
        let mut state = self.state.lock().await;
        self.push_outcome(&mut state, true);

        let max = self.config.max_ceiling.max(1) as f64;
        state.ceiling = if latency > self.config.latency_threshold {
            (state.ceiling * 0.75).max(1.0)
        } else if state.outcomes.len() >= self.config.window && state.failure_rate() == 0.0 {
            max
        } else {
            (state.ceiling.max(1.0) * 2.0).min(max)
        };
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        self.push_outcome(&mut state, false);

        state.ceiling *= 0.5;
        if state.ceiling < 1.0 {
            state.ceiling = 0.0;
            state.paused_until = Some(Instant::now() + self.config.pause);
            tracing::warn!(
                pause_ms = self.config.pause.as_millis() as u64,
                "Flow control paused admission"
            );
        }
    }

    fn push_outcome(&self, state: &mut FlowState, ok: bool) {
        if self.config.window == 0 {
            return;
        }
        if state.outcomes.len() >= self.config.window {
            state.outcomes.pop_front();
        }
        state.outcomes.push_back(ok);
    }

    /// Current ceiling in whole records (for monitoring)
    pub async fn ceiling(&self) -> usize {
        self.state.lock().await.ceiling.floor() as usize
    }

    pub async fn failure_rate(&self) -> f64 {
        self.state.lock().await.failure_rate()
    }
}

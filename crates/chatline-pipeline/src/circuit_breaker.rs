//! Circuit Breaker
//!
//! Stops a worker (or the send path) from hammering a dependency that is
//! failing. Three states:
//!
//! - **Closed**: normal operation, every request passes
//! - **Open**: too many consecutive failures, every request is rejected
//! - **HalfOpen**: the cooldown elapsed, exactly one trial request passes
//!
//! ## State Transitions
//!
//! ```text
//! ┌────────┐  failures >= threshold  ┌──────┐
//! │ Closed │ ──────────────────────> │ Open │ <───────────┐
//! └───▲────┘                         └───┬──┘             │
//!     │                                  │ cooldown       │ trial failed
//!     │ trial succeeded                  ▼ elapsed        │ (cooldown doubles)
//!     │                            ┌──────────┐           │
//!     └─────────────────────────── │ HalfOpen │ ──────────┘
//!                                  └──────────┘
//! ```
//!
//! The trial slot is a single flag taken with compare-and-swap, so concurrent
//! callers can never run two probes. A caller that took the slot but ended up
//! not exercising the dependency must hand it back with
//! [`CircuitBreaker::release_probe`].
//!
//! Each time the breaker re-opens without having closed in between, the
//! cooldown doubles (`cooldown * 2^(trips - 1)`), capped at `max_cooldown`.
//!
//! ## Performance
//!
//! - State checks are atomic loads
//! - Transitions are atomic stores / compare-and-swap
//! - No background tasks

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use chatline_observability::metrics::{
    BREAKER_CLOSED, BREAKER_HALF_OPEN, BREAKER_OPEN, BREAKER_STATE,
};
use serde::{Deserialize, Serialize};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed = 0,
    /// Too many failures - reject requests immediately
    Open = 1,
    /// Cooldown elapsed - one trial request allowed
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl CircuitState {
    fn metric_value(self) -> i64 {
        match self {
            CircuitState::Closed => BREAKER_CLOSED,
            CircuitState::Open => BREAKER_OPEN,
            CircuitState::HalfOpen => BREAKER_HALF_OPEN,
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Cooldown after the first trip
    pub cooldown: Duration,
    /// Upper bound for the doubled cooldown
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

pub struct CircuitBreaker {
    /// Label for logs and the state gauge
    name: String,
    /// Current state (0=Closed, 1=Open, 2=HalfOpen)
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Trips since the breaker last closed
    trips: AtomicU32,
    /// When the breaker last opened (micros since `origin`)
    opened_at: AtomicU64,
    /// Trial slot in HalfOpen
    probe_in_flight: AtomicBool,
    origin: Instant,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            trips: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            origin: Instant::now(),
            config,
        };
        breaker.publish(CircuitState::Closed);
        breaker
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn elapsed_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    /// Ask for permission to call the protected dependency.
    ///
    /// Closed: always true. Open: false until the cooldown has elapsed, then
    /// the breaker moves to HalfOpen and the first caller gets the trial.
    /// HalfOpen: true only for the caller that wins the trial slot.
    pub fn try_acquire(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,

            CircuitState::Open => {
                let opened_at = self.opened_at.load(Ordering::Acquire);
                let cooldown = self.current_cooldown().as_micros() as u64;
                if self.elapsed_micros().saturating_sub(opened_at) < cooldown {
                    return false;
                }

                if self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    tracing::info!(breaker = %self.name, "Circuit half-open, allowing one trial");
                    self.publish(CircuitState::HalfOpen);
                }
                self.take_probe()
            }

            CircuitState::HalfOpen => self.take_probe(),
        }
    }

    fn take_probe(&self) -> bool {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Hand back a trial slot that was acquired but not used
    pub fn release_probe(&self) {
        self.probe_in_flight.store(false, Ordering::Release);
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                self.transition_to_closed();
            }
            CircuitState::Open => {
                // Late result from before the trip
            }
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    self.transition_to_open(CircuitState::Closed);
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to_open(CircuitState::HalfOpen);
            }
            CircuitState::Open => {}
        }
    }

    /// Open immediately, regardless of the failure count
    pub fn trip(&self) {
        let current = self.state();
        if current != CircuitState::Open {
            self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
            self.transition_to_open(current);
        }
    }

    /// Move `from` -> Open. Only one of several racing callers wins.
    fn transition_to_open(&self, from: CircuitState) {
        self.opened_at
            .store(self.elapsed_micros(), Ordering::Release);
        if self
            .state
            .compare_exchange(
                from as u8,
                CircuitState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let trips = self.trips.fetch_add(1, Ordering::AcqRel) + 1;
        self.probe_in_flight.store(false, Ordering::Release);
        self.publish(CircuitState::Open);

        tracing::warn!(
            breaker = %self.name,
            failures = self.consecutive_failures.load(Ordering::Acquire),
            trips = trips,
            cooldown_ms = self.current_cooldown().as_millis() as u64,
            "Circuit opened"
        );
    }

    fn transition_to_closed(&self) {
        let was = self.state();
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.trips.store(0, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
        self.publish(CircuitState::Closed);

        if was != CircuitState::Closed {
            tracing::info!(breaker = %self.name, "Circuit closed");
        }
    }

    fn publish(&self, state: CircuitState) {
        BREAKER_STATE
            .with_label_values(&[self.name.as_str()])
            .set(state.metric_value());
    }

    /// Cooldown that applies to the current (or next) open period
    pub fn current_cooldown(&self) -> Duration {
        let trips = self.trips.load(Ordering::Acquire).max(1);
        let factor = 1u32 << (trips - 1).min(16);
        self.config
            .cooldown
            .saturating_mul(factor)
            .min(self.config.max_cooldown)
    }

    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn trips(&self) -> u32 {
        self.trips.load(Ordering::Acquire)
    }

    /// Manually reset the circuit to closed state
    pub fn reset(&self) {
        self.transition_to_closed();
    }
}

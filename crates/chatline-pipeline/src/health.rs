//! Health Snapshots
//!
//! Point-in-time views of the pipeline for `/health` and for tests. Building a
//! snapshot reads atomics only; it never touches Redis or the database.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::circuit_breaker::CircuitState;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub name: String,
    /// Depth observed at the start of the last cycle
    pub buffer_depth: u64,
    pub breaker_state: CircuitState,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub persisted: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every breaker closed
    Healthy,
    /// At least one breaker not closed, persistence still possible
    Degraded,
    /// Every worker breaker open
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub status: HealthStatus,
    pub send_breaker: CircuitState,
    pub workers: Vec<WorkerHealth>,
}

impl PipelineHealth {
    pub fn new(send_breaker: CircuitState, workers: Vec<WorkerHealth>) -> Self {
        let all_open = !workers.is_empty()
            && workers
                .iter()
                .all(|w| w.breaker_state == CircuitState::Open);
        let all_closed = send_breaker == CircuitState::Closed
            && workers
                .iter()
                .all(|w| w.breaker_state == CircuitState::Closed);

        let status = if all_open {
            HealthStatus::Unavailable
        } else if all_closed {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            status,
            send_breaker,
            workers,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status != HealthStatus::Unavailable
    }

    pub fn total_backlog(&self) -> u64 {
        self.workers.iter().map(|w| w.buffer_depth).sum()
    }
}

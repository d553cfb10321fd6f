//! Flush Manager
//!
//! Chooses the batch size and the pause between worker cycles.
//!
//! The batch ceiling adapts to write latency: it starts at `max_batch_size`,
//! doubles (capped) while writes finish in under half of `target_latency`, and
//! halves (floored at `min_batch_size`) when a write exceeds the target. The
//! requested size is `min(depth, ceiling)`, which is zero only for an empty
//! buffer.
//!
//! After a full batch the next cycle starts after `busy_interval` to keep
//! draining a backlog; otherwise the worker waits `idle_interval`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    pub target_latency: Duration,
    pub busy_interval: Duration,
    pub idle_interval: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            min_batch_size: 10,
            target_latency: Duration::from_millis(500),
            busy_interval: Duration::from_millis(10),
            idle_interval: Duration::from_millis(1000),
        }
    }
}

pub struct FlushManager {
    config: FlushConfig,
    ceiling: usize,
    last_requested: usize,
    last_drained: usize,
}

impl FlushManager {
    pub fn new(config: FlushConfig) -> Self {
        let max = config.max_batch_size.max(1);
        let min = config.min_batch_size.clamp(1, max);
        Self {
            config: FlushConfig {
                max_batch_size: max,
                min_batch_size: min,
                ..config
            },
            ceiling: max,
            last_requested: 0,
            last_drained: 0,
        }
    }

    pub fn next_batch_size(&mut self, depth: u64, recent_latency: Option<Duration>) -> usize {
        if let Some(latency) = recent_latency {
            if latency > self.config.target_latency {
                self.ceiling = (self.ceiling / 2).max(self.config.min_batch_size);
            } else if latency < self.config.target_latency / 2 {
                self.ceiling = self
                    .ceiling
                    .saturating_mul(2)
                    .min(self.config.max_batch_size);
            }
        }

        let size = usize::try_from(depth).unwrap_or(usize::MAX).min(self.ceiling);
        self.last_requested = size;
        size
    }

    /// Report how many entries the cycle actually drained
    pub fn record(&mut self, drained: usize) {
        self.last_drained = drained;
    }

    pub fn next_flush_delay(&self) -> Duration {
        if self.last_drained > 0 && self.last_drained >= self.last_requested {
            self.config.busy_interval
        } else {
            self.config.idle_interval
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn idle_interval(&self) -> Duration {
        self.config.idle_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> FlushManager {
        FlushManager::new(FlushConfig {
            max_batch_size: 100,
            min_batch_size: 10,
            target_latency: Duration::from_millis(100),
            busy_interval: Duration::from_millis(5),
            idle_interval: Duration::from_millis(500),
        })
    }

    #[test]
    fn test_size_is_min_of_depth_and_ceiling() {
        let mut flush = manager();
        assert_eq!(flush.next_batch_size(0, None), 0);
        assert_eq!(flush.next_batch_size(7, None), 7);
        assert_eq!(flush.next_batch_size(1_000, None), 100);
    }

    #[test]
    fn test_slow_writes_shrink_ceiling_to_floor() {
        let mut flush = manager();
        let slow = Some(Duration::from_millis(300));
        assert_eq!(flush.next_batch_size(1_000, slow), 50);
        assert_eq!(flush.next_batch_size(1_000, slow), 25);
        assert_eq!(flush.next_batch_size(1_000, slow), 12);
        assert_eq!(flush.next_batch_size(1_000, slow), 10);
        assert_eq!(flush.next_batch_size(1_000, slow), 10);
    }

    #[test]
    fn test_fast_writes_grow_ceiling_back() {
        let mut flush = manager();
        let slow = Some(Duration::from_millis(300));
        flush.next_batch_size(1_000, slow);
        flush.next_batch_size(1_000, slow);
        assert_eq!(flush.ceiling(), 25);

        let fast = Some(Duration::from_millis(10));
        assert_eq!(flush.next_batch_size(1_000, fast), 50);
        assert_eq!(flush.next_batch_size(1_000, fast), 100);
        assert_eq!(flush.next_batch_size(1_000, fast), 100);

        // Between half the target and the target: unchanged
        assert_eq!(flush.next_batch_size(1_000, Some(Duration::from_millis(70))), 100);
    }

    #[test]
    fn test_delay_depends_on_full_batch() {
        let mut flush = manager();
        flush.next_batch_size(1_000, None);
        flush.record(100);
        assert_eq!(flush.next_flush_delay(), Duration::from_millis(5));

        flush.next_batch_size(1_000, None);
        flush.record(40);
        assert_eq!(flush.next_flush_delay(), Duration::from_millis(500));

        flush.next_batch_size(0, None);
        flush.record(0);
        assert_eq!(flush.next_flush_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_min_batch_never_zero() {
        let mut flush = FlushManager::new(FlushConfig {
            max_batch_size: 4,
            min_batch_size: 0,
            ..FlushConfig::default()
        });
        for _ in 0..5 {
            flush.next_batch_size(10, Some(Duration::from_secs(10)));
        }
        assert_eq!(flush.ceiling(), 1);
        assert_eq!(flush.next_batch_size(3, None), 1);
    }
}

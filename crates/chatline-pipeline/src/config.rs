//! Pipeline Configuration
//!
//! ## PipelineConfig
//!
//! - **node_id**: identifier-generator node (0..=1023), unique per process
//! - **buffer**: Redis primary buffer and in-memory fallback settings
//! - **worker**: settings shared by both batch workers (breaker, flow control,
//!   flush scheduling, retry policy, shutdown drain)
//! - **send_breaker**: breaker guarding enqueues into the primary buffer
//!
//! Every field has a default, so a partial document deserializes:
//!
//! ```ignore
//! let config: PipelineConfig = serde_json::from_str(r#"{"node_id": 3}"#)?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::PipelineError;
use crate::failure::FailureConfig;
use crate::flow::FlowControlConfig;
use crate::flush::FlushConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub node_id: u16,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default = "default_send_breaker")]
    pub send_breaker: CircuitBreakerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            buffer: BufferConfig::default(),
            worker: WorkerConfig::default(),
            send_breaker: default_send_breaker(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.node_id > chatline_core::id::MAX_NODE {
            return Err(PipelineError::Config(format!(
                "node_id {} exceeds {}",
                self.node_id,
                chatline_core::id::MAX_NODE
            )));
        }
        if self.buffer.fallback_capacity == 0 {
            return Err(PipelineError::Config(
                "fallback_capacity must be at least 1".to_string(),
            ));
        }
        if self.worker.flush.max_batch_size == 0 {
            return Err(PipelineError::Config(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.buffer.redis_shards == 0 {
            return Err(PipelineError::Config(
                "redis_shards must be at least 1".to_string(),
            ));
        }
        if self.buffer.key_ttl <= self.worker.retention {
            return Err(PipelineError::Config(format!(
                "key_ttl ({:?}) must exceed retention ({:?})",
                self.buffer.key_ttl, self.worker.retention
            )));
        }
        if self.worker.breaker.failure_threshold == 0 || self.send_breaker.failure_threshold == 0 {
            return Err(PipelineError::Config(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Redis connection URL (default: redis://127.0.0.1:6379)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Key prefix of the buffer lists (default: chat:buffer)
    #[serde(default = "default_redis_key")]
    pub redis_key: String,

    /// Number of lists messages are spread over by chat room (default: 1)
    #[serde(default = "default_redis_shards")]
    pub redis_shards: usize,

    /// Maximum entries per shard list (default: 100,000)
    #[serde(default = "default_redis_max_len")]
    pub redis_max_len: u64,

    /// Recent messages kept per room for reads, 0 disables (default: 50)
    #[serde(default = "default_history_len")]
    pub history_len: usize,

    /// TTL of every Redis key, a safety net for abandoned keys; must exceed
    /// the worker retention (default: 72h)
    #[serde(default = "default_key_ttl")]
    pub key_ttl: Duration,

    /// Bound on every Redis call (default: 2s)
    #[serde(default = "default_command_timeout")]
    pub command_timeout: Duration,

    /// Capacity of the in-memory fallback buffer (default: 10,000)
    #[serde(default = "default_fallback_capacity")]
    pub fallback_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            redis_key: default_redis_key(),
            redis_shards: default_redis_shards(),
            redis_max_len: default_redis_max_len(),
            history_len: default_history_len(),
            key_ttl: default_key_ttl(),
            command_timeout: default_command_timeout(),
            fallback_capacity: default_fallback_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub flow: FlowControlConfig,

    #[serde(default)]
    pub flush: FlushConfig,

    #[serde(default)]
    pub failure: FailureConfig,

    /// Drained messages older than this are dead-lettered instead of
    /// written (default: 24h)
    #[serde(default = "default_retention")]
    pub retention: Duration,

    /// Maximum extra cycles run after the shutdown signal (default: 10)
    #[serde(default = "default_shutdown_drain_rounds")]
    pub shutdown_drain_rounds: u32,

    /// Minimum gap between two logged buffer connection errors (default: 60s)
    #[serde(default = "default_log_throttle")]
    pub log_throttle: Duration,

    /// Pause after a buffer error (default: 5s)
    #[serde(default = "default_error_backoff")]
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            flow: FlowControlConfig::default(),
            flush: FlushConfig::default(),
            failure: FailureConfig::default(),
            retention: default_retention(),
            shutdown_drain_rounds: default_shutdown_drain_rounds(),
            log_throttle: default_log_throttle(),
            error_backoff: default_error_backoff(),
        }
    }
}

fn default_send_breaker() -> CircuitBreakerConfig {
    // Trips on the first unavailable enqueue
    CircuitBreakerConfig {
        failure_threshold: 1,
        cooldown: Duration::from_secs(5),
        max_cooldown: Duration::from_secs(60),
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_key() -> String {
    "chat:buffer".to_string()
}

fn default_redis_shards() -> usize {
    1
}

fn default_redis_max_len() -> u64 {
    100_000
}

fn default_history_len() -> usize {
    50
}

fn default_key_ttl() -> Duration {
    Duration::from_secs(72 * 60 * 60)
}

fn default_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_fallback_capacity() -> usize {
    10_000
}

fn default_shutdown_drain_rounds() -> u32 {
    10
}

fn default_log_throttle() -> Duration {
    Duration::from_secs(60)
}

fn default_error_backoff() -> Duration {
    Duration::from_secs(5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"node_id": 3, "buffer": {"fallback_capacity": 50}}"#).unwrap();
        assert_eq!(config.node_id, 3);
        assert_eq!(config.buffer.fallback_capacity, 50);
        assert_eq!(config.buffer.redis_key, "chat:buffer");
        assert_eq!(config.worker.shutdown_drain_rounds, 10);
        assert_eq!(config.send_breaker.failure_threshold, 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig {
            node_id: 2000,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());

        config.node_id = 1;
        config.buffer.fallback_capacity = 0;
        assert!(config.validate().is_err());

        config.buffer.fallback_capacity = 10;
        config.buffer.redis_shards = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_ttl_must_outlive_retention() {
        let mut config = PipelineConfig::default();
        config.validate().unwrap();

        config.worker.retention = config.buffer.key_ttl;
        assert!(config.validate().is_err());
    }
}

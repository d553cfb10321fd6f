//! Environment Configuration
//!
//! ### Server
//! - `CHATLINE_ADDR`: HTTP bind address (default: 0.0.0.0:8080)
//! - `CHATLINE_DATABASE_URL`: `postgres://...` URL or SQLite path
//!   (default: ./data/chat.db)
//!
//! ### Pipeline
//! - `CHATLINE_NODE_ID`: id generator node, 0..=1023 (default: 0)
//! - `CHATLINE_REDIS_URL`: primary buffer (default: redis://127.0.0.1:6379)
//! - `CHATLINE_REDIS_KEY`: Redis key prefix (default: chat:buffer)
//! - `CHATLINE_REDIS_SHARDS`: buffer lists, messages spread by room (default: 1)
//! - `CHATLINE_RETENTION_SECS`: age after which buffered messages are
//!   dead-lettered (default: 86400)
//! - `CHATLINE_FALLBACK_CAPACITY`: in-memory buffer size (default: 10000)
//! - `CHATLINE_MAX_BATCH`: largest batch per write (default: 500)
//! - `CHATLINE_FLUSH_INTERVAL_MS`: idle poll interval (default: 1000)
//! - `CHATLINE_MAX_RETRIES`: attempts before dead-lettering (default: 3)
//! - `CHATLINE_FAILURE_THRESHOLD`: failures that open a worker breaker (default: 5)

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chatline_pipeline::PipelineConfig;
use chatline_store::{MessageStore, PostgresMessageStore, SqliteMessageStore};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub database_url: String,
    pub pipeline: PipelineConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; unset variables keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let addr = lookup("CHATLINE_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("CHATLINE_ADDR is not a socket address")?;

        let database_url =
            lookup("CHATLINE_DATABASE_URL").unwrap_or_else(|| "./data/chat.db".to_string());

        let mut pipeline = PipelineConfig::default();
        if let Some(node_id) = parse(&lookup, "CHATLINE_NODE_ID")? {
            pipeline.node_id = node_id;
        }
        if let Some(url) = lookup("CHATLINE_REDIS_URL") {
            pipeline.buffer.redis_url = url;
        }
        if let Some(key) = lookup("CHATLINE_REDIS_KEY") {
            pipeline.buffer.redis_key = key;
        }
        if let Some(shards) = parse(&lookup, "CHATLINE_REDIS_SHARDS")? {
            pipeline.buffer.redis_shards = shards;
        }
        if let Some(secs) = parse(&lookup, "CHATLINE_RETENTION_SECS")? {
            pipeline.worker.retention = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse(&lookup, "CHATLINE_FALLBACK_CAPACITY")? {
            pipeline.buffer.fallback_capacity = capacity;
        }
        if let Some(max_batch) = parse(&lookup, "CHATLINE_MAX_BATCH")? {
            pipeline.worker.flush.max_batch_size = max_batch;
            pipeline.worker.flow.max_ceiling = max_batch;
        }
        if let Some(ms) = parse(&lookup, "CHATLINE_FLUSH_INTERVAL_MS")? {
            pipeline.worker.flush.idle_interval = Duration::from_millis(ms);
        }
        if let Some(retries) = parse(&lookup, "CHATLINE_MAX_RETRIES")? {
            pipeline.worker.failure.max_retries = retries;
        }
        if let Some(threshold) = parse(&lookup, "CHATLINE_FAILURE_THRESHOLD")? {
            pipeline.worker.breaker.failure_threshold = threshold;
        }

        pipeline.validate()?;

        Ok(Self {
            addr,
            database_url,
            pipeline,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("{} has an invalid value: {}", key, raw))
        })
        .transpose()
}

/// Open the durable store named by `database_url`
pub async fn open_store(database_url: &str) -> Result<Arc<dyn MessageStore>> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        tracing::info!("Connecting to PostgreSQL message store");
        let store = PostgresMessageStore::new(database_url)
            .await
            .context("failed to open PostgreSQL store")?;
        return Ok(Arc::new(store));
    }

    let path = database_url.strip_prefix("sqlite://").unwrap_or(database_url);
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    tracing::info!("Opening SQLite message store at {}", path);
    let store = SqliteMessageStore::new(path)
        .await
        .context("failed to open SQLite store")?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.database_url, "./data/chat.db");
        assert_eq!(config.pipeline.node_id, 0);
        assert_eq!(config.pipeline.buffer.fallback_capacity, 10_000);
        assert_eq!(config.pipeline.worker.failure.max_retries, 3);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("CHATLINE_ADDR", "127.0.0.1:9000"),
            ("CHATLINE_NODE_ID", "17"),
            ("CHATLINE_REDIS_URL", "redis://cache:6379"),
            ("CHATLINE_FALLBACK_CAPACITY", "50"),
            ("CHATLINE_MAX_BATCH", "100"),
            ("CHATLINE_FLUSH_INTERVAL_MS", "250"),
            ("CHATLINE_MAX_RETRIES", "5"),
            ("CHATLINE_REDIS_SHARDS", "10"),
            ("CHATLINE_RETENTION_SECS", "3600"),
        ]))
        .unwrap();

        assert_eq!(config.addr.port(), 9000);
        assert_eq!(config.pipeline.node_id, 17);
        assert_eq!(config.pipeline.buffer.redis_url, "redis://cache:6379");
        assert_eq!(config.pipeline.buffer.fallback_capacity, 50);
        assert_eq!(config.pipeline.worker.flush.max_batch_size, 100);
        assert_eq!(config.pipeline.worker.flow.max_ceiling, 100);
        assert_eq!(
            config.pipeline.worker.flush.idle_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.pipeline.worker.failure.max_retries, 5);
        assert_eq!(config.pipeline.buffer.redis_shards, 10);
        assert_eq!(config.pipeline.worker.retention, Duration::from_secs(3600));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(ServerConfig::from_lookup(lookup(&[("CHATLINE_NODE_ID", "abc")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("CHATLINE_NODE_ID", "4096")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("CHATLINE_MAX_BATCH", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("CHATLINE_REDIS_SHARDS", "0")])).is_err());
        // Must stay below the 72h key TTL
        assert!(
            ServerConfig::from_lookup(lookup(&[("CHATLINE_RETENTION_SECS", "604800")])).is_err()
        );
        assert!(ServerConfig::from_lookup(lookup(&[("CHATLINE_ADDR", "nowhere")])).is_err());
    }
}

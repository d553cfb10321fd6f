//! Chatline Persistence Pipeline
//!
//! Write-behind persistence for chat messages. Senders enqueue into a fast
//! buffer and return immediately; two background workers move messages in
//! batches into the durable store.
//!
//! ## Components
//!
//! - [`buffer`]: Redis primary and in-memory fallback buffers
//! - [`sender`]: the send path, routing between the buffers
//! - [`worker`]: batch persistence workers, one per buffer
//! - [`writer`]: batch writer strategy over the durable store
//! - [`flush`]: batch sizing and cycle pacing
//! - [`flow`]: adaptive admission control
//! - [`circuit_breaker`]: per-worker and send-path breakers
//! - [`failure`] / [`dead_letter`]: retry, isolation and dead-letter decisions
//! - [`pipeline`]: assembly, health and shutdown
//!
//! ## Usage
//!
//! ```ignore
//! use chatline_pipeline::{Pipeline, PipelineConfig};
//!
//! let ids = IdGenerator::init_global(config.node_id)?;
//! let pipeline = Pipeline::connect(&config, ids, store)?;
//!
//! let receipt = pipeline.sender().send(&ctx, "hello").await?;
//!
//! // On shutdown
//! let reports = pipeline.shutdown().await;
//! ```

pub mod buffer;
pub mod circuit_breaker;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod failure;
pub mod flow;
pub mod flush;
pub mod health;
pub mod pipeline;
pub mod sender;
pub mod worker;
pub mod writer;

pub use buffer::{MemoryBuffer, MessageBuffer, RawEntry, RedisBuffer};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{BufferConfig, PipelineConfig, WorkerConfig};
pub use dead_letter::{DeadLetterSink, LogDeadLetterSink, StoreDeadLetterSink};
pub use error::{
    BufferError, PipelineError, Result, SendError, WriteError, WriteErrorKind,
};
pub use failure::{Disposition, FailureConfig, FailureHandler};
pub use flow::{FlowControl, FlowControlConfig};
pub use flush::{FlushConfig, FlushManager};
pub use health::{HealthStatus, PipelineHealth, WorkerHealth};
pub use pipeline::Pipeline;
pub use sender::{BufferTier, MessageSender, SendReceipt};
pub use worker::{BatchWorker, CycleOutcome, WorkerReport, EXPIRED_REASON};
pub use writer::{MessageWriter, StoreWriter};

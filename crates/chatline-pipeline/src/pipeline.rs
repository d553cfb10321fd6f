//! Pipeline Assembly
//!
//! Wires the send path, both buffers and both workers together:
//!
//! ```text
//!                      ┌──────────────┐  drain   ┌──────────────┐
//!  send ──primary────> │ RedisBuffer  │ ───────> │ redis-worker │ ──┐
//!    │                 └──────────────┘          └──────────────┘   │   ┌──────────────┐
//!    │                        ▲ overflow for retries    │           ├─> │ MessageStore │
//!    │                 ┌──────┴───────┐  drain   ┌──────▼───────┐   │   └──────────────┘
//!    └──fallback────>  │ MemoryBuffer │ ───────> │ memory-worker│ ──┘
//!                      └──────────────┘          └──────────────┘
//! ```
//!
//! The workers run independently; neither buffer has priority over the other.
//! [`Pipeline::shutdown`] signals both, waits for their final drain and
//! returns their reports.

use std::sync::Arc;

use chatline_core::IdGenerator;
use chatline_store::MessageStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::buffer::{MemoryBuffer, MessageBuffer, RedisBuffer};
use crate::config::PipelineConfig;
use crate::dead_letter::{DeadLetterSink, StoreDeadLetterSink};
use crate::error::{PipelineError, Result};
use crate::health::PipelineHealth;
use crate::sender::MessageSender;
use crate::worker::{BatchWorker, WorkerReport};
use crate::writer::{MessageWriter, StoreWriter};

pub const PRIMARY_BUFFER: &str = "redis";
pub const FALLBACK_BUFFER: &str = "memory";
pub const PRIMARY_WORKER: &str = "redis-worker";
pub const FALLBACK_WORKER: &str = "memory-worker";

pub struct Pipeline {
    sender: Arc<MessageSender>,
    workers: Vec<Arc<BatchWorker>>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<WorkerReport>>,
}

impl Pipeline {
    /// Production wiring: Redis primary, in-memory fallback, durable store
    /// writer and dead-letter table.
    pub fn connect(
        config: &PipelineConfig,
        ids: &'static IdGenerator,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        config.validate()?;

        let primary: Arc<dyn MessageBuffer> =
            Arc::new(RedisBuffer::new(PRIMARY_BUFFER, &config.buffer)?.with_node(config.node_id));
        let fallback: Arc<dyn MessageBuffer> = Arc::new(MemoryBuffer::new(
            FALLBACK_BUFFER,
            config.buffer.fallback_capacity,
        ));
        let writer: Arc<dyn MessageWriter> = Arc::new(StoreWriter::new(store.clone()));
        let dead_letters: Arc<dyn DeadLetterSink> = Arc::new(StoreDeadLetterSink::new(store));

        Self::start(config, ids, primary, fallback, writer, dead_letters)
    }

    /// Assemble from explicit parts and spawn both workers.
    ///
    /// `ids` must be the generator for `config.node_id`.
    pub fn start(
        config: &PipelineConfig,
        ids: &'static IdGenerator,
        primary: Arc<dyn MessageBuffer>,
        fallback: Arc<dyn MessageBuffer>,
        writer: Arc<dyn MessageWriter>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Result<Self> {
        config.validate()?;
        if ids.node() != config.node_id {
            return Err(PipelineError::Config(format!(
                "id generator runs as node {} but node_id is {}",
                ids.node(),
                config.node_id
            )));
        }

        let sender = Arc::new(MessageSender::new(
            ids,
            primary.clone(),
            fallback.clone(),
            config.send_breaker.clone(),
        ));

        let primary_worker = Arc::new(
            BatchWorker::new(
                PRIMARY_WORKER,
                primary,
                writer.clone(),
                dead_letters.clone(),
                config.worker.clone(),
            )
            .with_overflow(fallback.clone()),
        );
        let fallback_worker = Arc::new(BatchWorker::new(
            FALLBACK_WORKER,
            fallback,
            writer,
            dead_letters,
            config.worker.clone(),
        ));

        let (shutdown, rx) = watch::channel(false);
        let workers = vec![primary_worker, fallback_worker];
        let handles = workers
            .iter()
            .map(|w| Arc::clone(w).spawn(rx.clone()))
            .collect();

        tracing::info!(node_id = ids.node(), "Persistence pipeline started");

        Ok(Self {
            sender,
            workers,
            shutdown,
            handles,
        })
    }

    pub fn sender(&self) -> Arc<MessageSender> {
        Arc::clone(&self.sender)
    }

    pub fn workers(&self) -> &[Arc<BatchWorker>] {
        &self.workers
    }

    pub fn health(&self) -> PipelineHealth {
        PipelineHealth::new(
            self.sender.breaker_state(),
            self.workers.iter().map(|w| w.health()).collect(),
        )
    }

    /// Signal both workers and wait for them to finish their final drain
    pub async fn shutdown(self) -> Vec<WorkerReport> {
        tracing::info!("Stopping persistence pipeline");
        // Fails only if every worker already exited
        let _ = self.shutdown.send(true);

        let mut reports = Vec::with_capacity(self.handles.len());
        for result in futures::future::join_all(self.handles).await {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(error = %e, "Batch worker task failed"),
            }
        }
        reports
    }
}

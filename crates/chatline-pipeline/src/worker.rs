//! Batch Persistence Worker
//!
//! One worker drains one buffer into the durable store. The pipeline runs two:
//! one for the Redis primary and one for the in-memory fallback. They share
//! nothing but the store and the dead-letter sink.
//!
//! ## Cycle
//!
//! ```text
//! breaker? ──closed/probe──> depth ──> flush manager ──> flow control ──> drain
//!    │ open                                   │ 0              │ 0          │ empty
//!    ▼                                        ▼                ▼            ▼
//! Skipped                                   Idle           Throttled      Idle
//!
//! drain ──> decode ──> write ──ok──> Written(n)
//!             │          └─err──> failure handler ──> requeue / isolate / dead-letter
//!             ├─corrupt──> discard (dead-letter sink)
//!             └─older than retention──> dead-letter ("expired")
//! ```
//!
//! While the breaker is half-open the trial cycle first asks the writer for a
//! health check and stays [`CycleOutcome::Skipped`] if the store is still down,
//! so no batch is drained just to fail.
//!
//! Once every entry of a drained batch is written, requeued or dead-lettered
//! the batch is acknowledged to its buffer.
//!
//! A cycle always completes: every error is logged and turned into a
//! [`CycleOutcome`]. The shutdown signal is only looked at between cycles, so
//! a drained batch is always written or handed back before the task exits.
//!
//! ## Requeue Fallback
//!
//! Records scheduled for retry go back to the head of their own buffer. If that
//! fails they go to the overflow buffer (if configured), and if that fails too
//! they are dead-lettered. A drained record is never dropped.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chatline_core::{BufferedMessage, CodecError, MessageRecord};
use chatline_observability::metrics::{
    BATCH_SIZE, BUFFER_DEPTH, CONSECUTIVE_FAILURES, CYCLES_TOTAL, FLOW_CEILING,
    LAST_SUCCESS_TIMESTAMP, RECORDS_DEAD_LETTERED_TOTAL, RECORDS_DISCARDED_TOTAL,
    RECORDS_PERSISTED_TOTAL, RECORDS_REQUEUED_TOTAL, WRITE_ERRORS_TOTAL, WRITE_LATENCY,
};
use chatline_store::DeadLetter;
use chrono::{TimeZone, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::buffer::{MessageBuffer, RawEntry};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::WorkerConfig;
use crate::dead_letter::DeadLetterSink;
use crate::error::{BufferError, WriteErrorKind};
use crate::failure::{Disposition, FailureHandler};
use crate::flow::FlowControl;
use crate::flush::FlushManager;
use crate::health::WorkerHealth;
use crate::writer::MessageWriter;

/// Dead-letter reason for messages older than the retention
pub const EXPIRED_REASON: &str = "expired";

/// What a single cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Breaker open, nothing attempted
    Skipped,
    /// Flow control admitted nothing
    Throttled,
    /// Buffer empty
    Idle,
    /// Batch persisted (count of records written)
    Written(usize),
    /// Batch write failed; the failure handler took over
    Failed(WriteErrorKind),
    /// The buffer could not be read
    BufferError,
}

impl CycleOutcome {
    fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Skipped => "skipped",
            CycleOutcome::Throttled => "throttled",
            CycleOutcome::Idle => "idle",
            CycleOutcome::Written(_) => "written",
            CycleOutcome::Failed(_) => "failed",
            CycleOutcome::BufferError => "buffer_error",
        }
    }
}

/// Totals returned when a worker task stops
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub name: String,
    pub cycles: u64,
    pub persisted: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
    /// Entries left in the buffer, if it could still be read
    pub remaining: Option<u64>,
}

#[derive(Default)]
struct WorkerStats {
    cycles: AtomicU64,
    persisted: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    discarded: AtomicU64,
    last_depth: AtomicU64,
    /// Unix millis of the last successful write, 0 if none
    last_success_ms: AtomicI64,
}

/// Mutable per-cycle state; the lock also keeps cycles of one worker serial
struct CycleState {
    flush: FlushManager,
    last_latency: Option<Duration>,
    last_error_log: Option<Instant>,
}

pub struct BatchWorker {
    name: String,
    buffer: Arc<dyn MessageBuffer>,
    overflow: Option<Arc<dyn MessageBuffer>>,
    writer: Arc<dyn MessageWriter>,
    dead_letters: Arc<dyn DeadLetterSink>,
    breaker: CircuitBreaker,
    flow: FlowControl,
    failures: FailureHandler,
    config: WorkerConfig,
    state: Mutex<CycleState>,
    stats: WorkerStats,
}

impl BatchWorker {
    pub fn new(
        name: impl Into<String>,
        buffer: Arc<dyn MessageBuffer>,
        writer: Arc<dyn MessageWriter>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: WorkerConfig,
    ) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), config.breaker.clone()),
            flow: FlowControl::new(config.flow.clone()),
            failures: FailureHandler::new(config.failure.clone()),
            state: Mutex::new(CycleState {
                flush: FlushManager::new(config.flush.clone()),
                last_latency: None,
                last_error_log: None,
            }),
            stats: WorkerStats::default(),
            overflow: None,
            name,
            buffer,
            writer,
            dead_letters,
            config,
        }
    }

    /// Buffer that takes retries when the own buffer refuses them
    pub fn with_overflow(mut self, overflow: Arc<dyn MessageBuffer>) -> Self {
        self.overflow = Some(overflow);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn buffer(&self) -> &Arc<dyn MessageBuffer> {
        &self.buffer
    }

    /// Run one cycle and record its outcome
    pub async fn run_cycle(&self) -> CycleOutcome {
        let outcome = self.cycle().await;

        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        CYCLES_TOTAL
            .with_label_values(&[self.name.as_str(), outcome.label()])
            .inc();
        CONSECUTIVE_FAILURES
            .with_label_values(&[self.name.as_str()])
            .set(self.breaker.consecutive_failures() as i64);

        tracing::trace!(worker = %self.name, outcome = ?outcome, "Cycle finished");
        outcome
    }

    async fn cycle(&self) -> CycleOutcome {
        let mut state = self.state.lock().await;

        if !self.breaker.try_acquire() {
            return CycleOutcome::Skipped;
        }
        if self.breaker.state() == CircuitState::HalfOpen && !self.writer.is_healthy().await {
            self.breaker.record_failure();
            tracing::debug!(worker = %self.name, "Store still unhealthy, trial skipped");
            return CycleOutcome::Skipped;
        }

        let depth = match self.buffer.size().await {
            Ok(depth) => depth,
            Err(e) => return self.on_buffer_error(&mut state, e),
        };
        self.stats.last_depth.store(depth, Ordering::Relaxed);
        BUFFER_DEPTH
            .with_label_values(&[self.buffer.name()])
            .set(depth as i64);

        let latency = state.last_latency.take();
        let requested = state.flush.next_batch_size(depth, latency);
        if requested == 0 {
            state.flush.record(0);
            // The buffer answered, which is all an empty poll can prove
            self.breaker.record_success();
            return CycleOutcome::Idle;
        }

        let allowed = self.flow.admit(requested).await;
        FLOW_CEILING
            .with_label_values(&[self.name.as_str()])
            .set(self.flow.ceiling().await as i64);
        if allowed == 0 {
            state.flush.record(0);
            self.breaker.release_probe();
            return CycleOutcome::Throttled;
        }

        let entries = match self.buffer.drain_up_to(allowed).await {
            Ok(entries) => entries,
            Err(e) => return self.on_buffer_error(&mut state, e),
        };
        state.flush.record(entries.len());
        if entries.is_empty() {
            self.breaker.record_success();
            return CycleOutcome::Idle;
        }
        BATCH_SIZE
            .with_label_values(&[self.name.as_str()])
            .observe(entries.len() as f64);

        let outcome = self.handle_batch(&mut state, &entries).await;
        if let Err(e) = self.buffer.acknowledge(&entries).await {
            tracing::warn!(
                worker = %self.name,
                batch = entries.len(),
                error = %e,
                "Acknowledge failed, batch will be delivered again"
            );
        }
        outcome
    }

    async fn handle_batch(&self, state: &mut CycleState, entries: &[RawEntry]) -> CycleOutcome {
        let cutoff = chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));

        let mut messages = Vec::with_capacity(entries.len());
        let mut expired = Vec::new();
        for entry in entries {
            match entry.decode() {
                Ok(message) if cutoff.map_or(false, |c| message.record.created_at < c) => {
                    expired.push(message)
                }
                Ok(message) => messages.push(message),
                Err(e) => self.discard_corrupt(entry.clone(), &e).await,
            }
        }

        if !expired.is_empty() {
            tracing::warn!(
                worker = %self.name,
                count = expired.len(),
                "Dead-lettering messages past retention"
            );
            self.dead_letter(expired, EXPIRED_REASON).await;
        }

        if messages.is_empty() {
            self.breaker.release_probe();
            return CycleOutcome::Written(0);
        }

        self.write_batch(state, messages).await
    }

    async fn write_batch(
        &self,
        state: &mut CycleState,
        messages: Vec<BufferedMessage>,
    ) -> CycleOutcome {
        let records: Vec<MessageRecord> = messages.iter().map(|m| m.record.clone()).collect();
        let start = Instant::now();

        match self.writer.write(&records).await {
            Ok(()) => {
                let latency = start.elapsed();
                WRITE_LATENCY
                    .with_label_values(&[self.name.as_str()])
                    .observe(latency.as_secs_f64());

                self.breaker.record_success();
                self.flow.record_success(latency).await;
                state.last_latency = Some(latency);
                self.mark_persisted(records.len());

                tracing::debug!(
                    worker = %self.name,
                    batch = records.len(),
                    latency_ms = latency.as_millis() as u64,
                    "Persisted batch"
                );
                CycleOutcome::Written(records.len())
            }
            Err(e) => {
                WRITE_ERRORS_TOTAL
                    .with_label_values(&[self.name.as_str(), e.kind.as_str()])
                    .inc();

                if e.is_retryable() {
                    self.breaker.record_failure();
                    self.flow.record_failure().await;
                } else {
                    // The store answered; the data was at fault
                    self.breaker.record_success();
                }

                tracing::warn!(
                    worker = %self.name,
                    batch = records.len(),
                    kind = e.kind.as_str(),
                    error = %e,
                    "Batch write failed"
                );

                let kind = e.kind;
                let dispositions = self.failures.handle(messages, &e);
                self.apply(dispositions).await;
                CycleOutcome::Failed(kind)
            }
        }
    }

    fn on_buffer_error(&self, state: &mut CycleState, e: BufferError) -> CycleOutcome {
        self.breaker.record_failure();

        if e.is_unavailable() {
            let now = Instant::now();
            let log_now = state
                .last_error_log
                .map(|last| now.duration_since(last) >= self.config.log_throttle)
                .unwrap_or(true);
            if log_now {
                state.last_error_log = Some(now);
                tracing::warn!(worker = %self.name, error = %e, "Buffer unavailable");
            } else {
                tracing::debug!(worker = %self.name, error = %e, "Buffer unavailable");
            }
        } else {
            tracing::error!(worker = %self.name, error = %e, "Buffer error");
        }
        CycleOutcome::BufferError
    }

    async fn apply(&self, dispositions: Vec<Disposition>) {
        for disposition in dispositions {
            match disposition {
                Disposition::RetryLater(messages) => self.requeue(messages).await,
                Disposition::DeadLetter { messages, reason } => {
                    self.dead_letter(messages, &reason).await
                }
                Disposition::Isolate(messages) => self.isolate(messages).await,
                Disposition::Discard { entries, reason } => self.discard(entries, &reason).await,
            }
        }
    }

    /// Bisect a rejected batch until the poison records stand alone.
    ///
    /// Halves that write cleanly are persisted; the failure handler decides
    /// about the rest, which ends with single records being dead-lettered.
    async fn isolate(&self, batch: Vec<BufferedMessage>) {
        tracing::info!(worker = %self.name, batch = batch.len(), "Isolating rejected records");

        let mut pending = vec![batch];
        while let Some(mut left) = pending.pop() {
            let right = left.split_off(left.len() / 2);

            for half in [left, right] {
                if half.is_empty() {
                    continue;
                }
                let records: Vec<MessageRecord> = half.iter().map(|m| m.record.clone()).collect();
                match self.writer.write(&records).await {
                    Ok(()) => self.mark_persisted(records.len()),
                    Err(e) => {
                        for disposition in self.failures.handle(half, &e) {
                            match disposition {
                                Disposition::Isolate(messages) => pending.push(messages),
                                Disposition::RetryLater(messages) => self.requeue(messages).await,
                                Disposition::DeadLetter { messages, reason } => {
                                    self.dead_letter(messages, &reason).await
                                }
                                Disposition::Discard { entries, reason } => {
                                    self.discard(entries, &reason).await
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn requeue(&self, messages: Vec<BufferedMessage>) {
        let count = messages.len();

        let error = match self.buffer.requeue_front(messages.clone()).await {
            Ok(()) => {
                self.mark_requeued(count);
                return;
            }
            Err(e) => e,
        };

        if let Some(overflow) = &self.overflow {
            tracing::warn!(
                worker = %self.name,
                count = count,
                overflow = %overflow.name(),
                error = %error,
                "Requeue failed, moving records to overflow buffer"
            );
            match overflow.requeue_front(messages.clone()).await {
                Ok(()) => {
                    self.mark_requeued(count);
                    return;
                }
                Err(e) => {
                    tracing::error!(worker = %self.name, error = %e, "Overflow requeue failed");
                }
            }
        }

        self.dead_letter(messages, &format!("requeue failed: {}", error))
            .await;
    }

    async fn dead_letter(&self, messages: Vec<BufferedMessage>, reason: &str) {
        if messages.is_empty() {
            return;
        }
        let letters: Vec<DeadLetter> = messages
            .iter()
            .map(|m| DeadLetter::for_message(m, reason, self.buffer.name()))
            .collect();
        let count = letters.len() as u64;

        self.dead_letters.record(letters).await;
        self.stats.dead_lettered.fetch_add(count, Ordering::Relaxed);
        RECORDS_DEAD_LETTERED_TOTAL
            .with_label_values(&[self.name.as_str()])
            .inc_by(count);
    }

    async fn discard_corrupt(&self, entry: RawEntry, error: &CodecError) {
        let disposition = self.failures.handle_corrupt(vec![entry], error);
        self.apply(vec![disposition]).await;
    }

    async fn discard(&self, entries: Vec<RawEntry>, reason: &str) {
        if entries.is_empty() {
            return;
        }
        let letters: Vec<DeadLetter> = entries
            .iter()
            .map(|e| DeadLetter::corrupt(&e.payload, reason, self.buffer.name()))
            .collect();
        let count = letters.len() as u64;

        self.dead_letters.record(letters).await;
        self.stats.discarded.fetch_add(count, Ordering::Relaxed);
        RECORDS_DISCARDED_TOTAL
            .with_label_values(&[self.name.as_str()])
            .inc_by(count);
    }

    fn mark_persisted(&self, count: usize) {
        let now = Utc::now();
        self.stats
            .persisted
            .fetch_add(count as u64, Ordering::Relaxed);
        self.stats
            .last_success_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);

        RECORDS_PERSISTED_TOTAL
            .with_label_values(&[self.name.as_str()])
            .inc_by(count as u64);
        LAST_SUCCESS_TIMESTAMP
            .with_label_values(&[self.name.as_str()])
            .set(now.timestamp());
    }

    fn mark_requeued(&self, count: usize) {
        self.stats
            .requeued
            .fetch_add(count as u64, Ordering::Relaxed);
        RECORDS_REQUEUED_TOTAL
            .with_label_values(&[self.name.as_str()])
            .inc_by(count as u64);
    }

    async fn delay_after(&self, outcome: CycleOutcome) -> Duration {
        let state = self.state.lock().await;
        match outcome {
            CycleOutcome::BufferError => self.config.error_backoff,
            CycleOutcome::Written(_) | CycleOutcome::Idle => state.flush.next_flush_delay(),
            CycleOutcome::Skipped | CycleOutcome::Throttled | CycleOutcome::Failed(_) => {
                state.flush.idle_interval()
            }
        }
    }

    /// Start the worker loop.
    ///
    /// The task runs until `shutdown` turns true (or its sender is dropped),
    /// then performs a bounded final drain and returns its totals.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<WorkerReport> {
        tokio::spawn(async move {
            tracing::info!(
                worker = %self.name,
                buffer = %self.buffer.name(),
                "Batch worker started"
            );

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let outcome = self.run_cycle().await;
                let delay = self.delay_after(outcome).await;

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.final_drain().await;
            let report = self.report().await;
            tracing::info!(
                worker = %self.name,
                persisted = report.persisted,
                dead_lettered = report.dead_lettered,
                remaining = ?report.remaining,
                "Batch worker stopped"
            );
            report
        })
    }

    async fn final_drain(&self) {
        for round in 0..self.config.shutdown_drain_rounds {
            match self.run_cycle().await {
                CycleOutcome::Written(n) if n > 0 => {
                    tracing::debug!(worker = %self.name, round = round, batch = n, "Shutdown drain");
                }
                _ => break,
            }
        }
    }

    pub async fn report(&self) -> WorkerReport {
        WorkerReport {
            name: self.name.clone(),
            cycles: self.stats.cycles.load(Ordering::Relaxed),
            persisted: self.stats.persisted.load(Ordering::Relaxed),
            requeued: self.stats.requeued.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
            remaining: self.buffer.size().await.ok(),
        }
    }

    pub fn health(&self) -> WorkerHealth {
        let last_success_ms = self.stats.last_success_ms.load(Ordering::Relaxed);
        let last_success = if last_success_ms > 0 {
            Utc.timestamp_millis_opt(last_success_ms).single()
        } else {
            None
        };

        WorkerHealth {
            name: self.name.clone(),
            buffer_depth: self.stats.last_depth.load(Ordering::Relaxed),
            breaker_state: self.breaker.state(),
            consecutive_failures: self.breaker.consecutive_failures(),
            last_success,
            persisted: self.stats.persisted.load(Ordering::Relaxed),
            requeued: self.stats.requeued.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
        }
    }
}

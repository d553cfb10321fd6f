#![allow(dead_code)]

//! Shared fakes for pipeline integration tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chatline_core::{codec, BufferedMessage, IdGenerator, MessageId, MessageRecord};
use chatline_pipeline::{
    BufferError, CircuitBreakerConfig, DeadLetterSink, FailureConfig, FlowControlConfig,
    FlushConfig, MessageBuffer, MessageWriter, RawEntry, WorkerConfig, WriteError,
};
use chatline_store::DeadLetter;

/// In-memory buffer with switchable faults
pub struct TestBuffer {
    name: String,
    queue: Mutex<VecDeque<RawEntry>>,
    next_sequence: AtomicU64,
    /// Number of upcoming enqueues that fail as unavailable
    pub fail_enqueues: AtomicUsize,
    pub fail_requeue: AtomicBool,
    /// Every operation fails as unavailable
    pub down: AtomicBool,
    acknowledged: Mutex<Vec<u64>>,
}

impl TestBuffer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            next_sequence: AtomicU64::new(1),
            fail_enqueues: AtomicUsize::new(0),
            fail_requeue: AtomicBool::new(false),
            down: AtomicBool::new(false),
            acknowledged: Mutex::new(Vec::new()),
        }
    }

    pub fn push_raw(&self, payload: &'static [u8]) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().unwrap().push_back(RawEntry {
            sequence,
            payload: Bytes::from_static(payload),
        });
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Sequences of every acknowledged entry, in call order
    pub fn acknowledged(&self) -> Vec<u64> {
        self.acknowledged.lock().unwrap().clone()
    }

    fn check_up(&self) -> Result<(), BufferError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BufferError::unavailable(&self.name, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBuffer for TestBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, message: &BufferedMessage) -> Result<u64, BufferError> {
        self.check_up()?;
        let pending = self.fail_enqueues.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_enqueues.store(pending - 1, Ordering::SeqCst);
            return Err(BufferError::unavailable(&self.name, "connection reset"));
        }

        let payload = codec::encode(message)?;
        let mut queue = self.queue.lock().unwrap();
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        queue.push_back(RawEntry { sequence, payload });
        Ok(sequence)
    }

    async fn drain_up_to(&self, max: usize) -> Result<Vec<RawEntry>, BufferError> {
        self.check_up()?;
        let mut queue = self.queue.lock().unwrap();
        let n = max.min(queue.len());
        Ok(queue.drain(..n).collect())
    }

    async fn acknowledge(&self, entries: &[RawEntry]) -> Result<(), BufferError> {
        self.check_up()?;
        self.acknowledged
            .lock()
            .unwrap()
            .extend(entries.iter().map(|e| e.sequence));
        Ok(())
    }

    async fn requeue_front(&self, messages: Vec<BufferedMessage>) -> Result<(), BufferError> {
        self.check_up()?;
        if self.fail_requeue.load(Ordering::SeqCst) {
            return Err(BufferError::unavailable(&self.name, "requeue refused"));
        }
        let mut queue = self.queue.lock().unwrap();
        for message in messages.iter().rev() {
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            queue.push_front(RawEntry {
                sequence,
                payload: codec::encode(message)?,
            });
        }
        Ok(())
    }

    async fn size(&self) -> Result<u64, BufferError> {
        self.check_up()?;
        Ok(self.queue.lock().unwrap().len() as u64)
    }

    async fn is_healthy(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }
}

/// Writer that fails according to a script and remembers every call
#[derive(Default)]
pub struct ScriptedWriter {
    inner: Option<Arc<dyn MessageWriter>>,
    /// Errors returned by the next calls, in order
    script: Mutex<VecDeque<WriteError>>,
    always: Option<WriteError>,
    /// Pauses applied to the next calls, in order
    delays: Mutex<VecDeque<Duration>>,
    /// Health check fails while set
    pub unhealthy: AtomicBool,
    calls: Mutex<Vec<Vec<MessageId>>>,
    written: Mutex<Vec<MessageRecord>>,
}

impl ScriptedWriter {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failing_first(errors: Vec<WriteError>) -> Self {
        Self {
            script: Mutex::new(errors.into()),
            ..Self::default()
        }
    }

    pub fn always_failing(error: WriteError) -> Self {
        Self {
            always: Some(error),
            ..Self::default()
        }
    }

    /// Succeeds, but the first calls take the given times
    pub fn slow_first(delays: Vec<Duration>) -> Self {
        Self {
            delays: Mutex::new(delays.into()),
            ..Self::default()
        }
    }

    /// Delegate successful calls to a real writer
    pub fn over(inner: Arc<dyn MessageWriter>) -> Self {
        Self {
            inner: Some(inner),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Vec<MessageId>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn written(&self) -> Vec<MessageRecord> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageWriter for ScriptedWriter {
    async fn write(&self, records: &[MessageRecord]) -> Result<(), WriteError> {
        self.calls
            .lock()
            .unwrap()
            .push(records.iter().map(|r| r.id).collect());

        let delay = self.delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.always {
            return Err(err.clone());
        }
        let scripted = self.script.lock().unwrap().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        if let Some(inner) = &self.inner {
            inner.write(records).await?;
        }
        self.written.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }
}

/// Dead-letter sink that keeps everything it receives
#[derive(Default)]
pub struct CollectingSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl CollectingSink {
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for CollectingSink {
    async fn record(&self, letters: Vec<DeadLetter>) {
        self.letters.lock().unwrap().extend(letters);
    }
}

pub fn records(ids: &IdGenerator, n: usize) -> Vec<MessageRecord> {
    (0..n)
        .map(|i| MessageRecord::new(ids.next_id(), 42, 1000 + i as i64, format!("message {}", i), None))
        .collect()
}

pub async fn fill(buffer: &dyn MessageBuffer, records: &[MessageRecord]) {
    for record in records {
        buffer
            .enqueue(&BufferedMessage::new(record.clone()))
            .await
            .unwrap();
    }
}

/// Small batches and short timers so scenarios run in milliseconds
pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(50),
            max_cooldown: Duration::from_millis(200),
        },
        flow: FlowControlConfig::default(),
        flush: FlushConfig {
            max_batch_size: 10,
            min_batch_size: 1,
            target_latency: Duration::from_secs(1),
            busy_interval: Duration::from_millis(1),
            idle_interval: Duration::from_millis(20),
        },
        failure: FailureConfig { max_retries: 3 },
        retention: Duration::from_secs(24 * 60 * 60),
        shutdown_drain_rounds: 10,
        log_throttle: Duration::from_secs(60),
        error_backoff: Duration::from_millis(20),
    }
}

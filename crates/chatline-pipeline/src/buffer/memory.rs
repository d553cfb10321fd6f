//! In-Process Fallback Buffer
//!
//! A bounded FIFO queue that lives in process memory. It takes over while the
//! primary buffer is unreachable and is drained by its own worker.
//!
//! Capacity is enforced on enqueue only: once `capacity` entries are queued,
//! new messages are refused with [`BufferError::Full`] so senders see
//! backpressure instead of unbounded memory growth. Requeued retries skip the
//! check since they already held a slot before they were drained.
//!
//! Contents are lost if the process dies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chatline_core::{codec, BufferedMessage};
use tokio::sync::Mutex;

use super::{MessageBuffer, RawEntry};
use crate::error::BufferError;

pub struct MemoryBuffer {
    name: String,
    capacity: usize,
    queue: Mutex<VecDeque<RawEntry>>,
    next_sequence: AtomicU64,
}

impl MemoryBuffer {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            queue: Mutex::new(VecDeque::new()),
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::AcqRel)
    }
}

#[async_trait]
impl MessageBuffer for MemoryBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, message: &BufferedMessage) -> Result<u64, BufferError> {
        let payload = codec::encode(message)?;

        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            return Err(BufferError::Full {
                buffer: self.name.clone(),
                capacity: self.capacity as u64,
            });
        }

        // Taken under the lock so queue order matches sequence order
        let sequence = self.sequence();
        queue.push_back(RawEntry { sequence, payload });
        Ok(sequence)
    }

    async fn drain_up_to(&self, max: usize) -> Result<Vec<RawEntry>, BufferError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut queue = self.queue.lock().await;
        let n = max.min(queue.len());
        Ok(queue.drain(..n).collect())
    }

    async fn requeue_front(&self, messages: Vec<BufferedMessage>) -> Result<(), BufferError> {
        if messages.is_empty() {
            return Ok(());
        }

        let payloads = messages
            .iter()
            .map(codec::encode)
            .collect::<Result<Vec<_>, _>>()?;

        let mut queue = self.queue.lock().await;
        for payload in payloads.into_iter().rev() {
            let sequence = self.sequence();
            queue.push_front(RawEntry { sequence, payload });
        }
        Ok(())
    }

    async fn size(&self) -> Result<u64, BufferError> {
        Ok(self.queue.lock().await.len() as u64)
    }

    async fn is_healthy(&self) -> bool {
        self.queue.lock().await.len() < self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatline_core::{IdGenerator, MessageRecord};

    fn messages(n: usize) -> Vec<BufferedMessage> {
        let ids = IdGenerator::new(5).unwrap();
        (0..n)
            .map(|i| {
                BufferedMessage::new(MessageRecord::new(ids.next_id(), 1, 2, format!("m{}", i), None))
            })
            .collect()
    }

    fn bodies(entries: &[RawEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.decode().unwrap().record.body)
            .collect()
    }

    #[tokio::test]
    async fn test_fifo_drain() {
        let buffer = MemoryBuffer::new("memory", 100);
        for msg in messages(5) {
            buffer.enqueue(&msg).await.unwrap();
        }

        let first = buffer.drain_up_to(3).await.unwrap();
        assert_eq!(bodies(&first), vec!["m0", "m1", "m2"]);
        assert!(first.windows(2).all(|w| w[0].sequence < w[1].sequence));

        let rest = buffer.drain_up_to(10).await.unwrap();
        assert_eq!(bodies(&rest), vec!["m3", "m4"]);
        assert!(buffer.drain_up_to(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_zero_is_noop() {
        let buffer = MemoryBuffer::new("memory", 10);
        buffer.enqueue(&messages(1)[0]).await.unwrap();
        assert!(buffer.drain_up_to(0).await.unwrap().is_empty());
        assert_eq!(buffer.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_buffer_rejects() {
        let buffer = MemoryBuffer::new("memory", 2);
        let msgs = messages(3);
        buffer.enqueue(&msgs[0]).await.unwrap();
        assert!(buffer.is_healthy().await);
        buffer.enqueue(&msgs[1]).await.unwrap();
        assert!(!buffer.is_healthy().await);

        let err = buffer.enqueue(&msgs[2]).await.unwrap_err();
        assert!(matches!(err, BufferError::Full { capacity: 2, .. }));
        assert_eq!(buffer.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_requeue_goes_to_head_in_order() {
        let buffer = MemoryBuffer::new("memory", 2);
        let msgs = messages(4);
        buffer.enqueue(&msgs[0]).await.unwrap();
        buffer.enqueue(&msgs[1]).await.unwrap();

        let drained: Vec<_> = buffer
            .drain_up_to(2)
            .await
            .unwrap()
            .iter()
            .map(|e| e.decode().unwrap())
            .collect();
        buffer.enqueue(&msgs[2]).await.unwrap();
        buffer.enqueue(&msgs[3]).await.unwrap();

        // Capacity does not apply to retries
        let retried: Vec<_> = drained.into_iter().map(BufferedMessage::retried).collect();
        buffer.requeue_front(retried).await.unwrap();
        assert_eq!(buffer.size().await.unwrap(), 4);

        let all = buffer.drain_up_to(10).await.unwrap();
        assert_eq!(bodies(&all), vec!["m0", "m1", "m2", "m3"]);
        assert_eq!(all[0].decode().unwrap().attempts, 1);
        assert_eq!(all[2].decode().unwrap().attempts, 0);
    }
}

//! Message Buffers
//!
//! A buffer holds encoded messages between the send path and the durable
//! store. Two implementations share one trait:
//!
//! - [`RedisBuffer`]: the primary, Redis lists shared by every node
//! - [`MemoryBuffer`]: the in-process fallback used while Redis is unavailable
//!
//! ## Ordering and Ownership
//!
//! Entries leave a buffer in the order they were pushed (FIFO); a sharded
//! buffer keeps that order per chat room. A drain removes entries atomically
//! and hands ownership to the caller; no entry is returned by two drains.
//! Retried messages go back to the head with [`MessageBuffer::requeue_front`]
//! so they are drained before anything newer.
//!
//! Once a drained batch has been written, requeued or dead-lettered the worker
//! calls [`MessageBuffer::acknowledge`]. Buffers that can lose a drain in
//! transit keep entries until then and hand unacknowledged ones out again.
//!
//! Every push (enqueue or requeue) is stamped with a sequence number that is
//! strictly increasing per buffer.

use async_trait::async_trait;
use bytes::Bytes;
use chatline_core::{codec, BufferedMessage, CodecError};

use crate::error::BufferError;

pub mod memory;
pub mod redis;

pub use memory::MemoryBuffer;
pub use redis::RedisBuffer;

/// An entry as stored by a buffer, before decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub sequence: u64,
    pub payload: Bytes,
}

impl RawEntry {
    pub fn decode(&self) -> Result<BufferedMessage, CodecError> {
        codec::decode(&self.payload)
    }
}

#[async_trait]
pub trait MessageBuffer: Send + Sync {
    /// Buffer name used in logs, metrics and dead letters
    fn name(&self) -> &str;

    /// Append a message at the tail, returning its sequence number
    async fn enqueue(&self, message: &BufferedMessage) -> Result<u64, BufferError>;

    /// Remove and return at most `max` of the oldest entries.
    ///
    /// Returns an empty vec when nothing is queued. `max == 0` returns an empty
    /// vec without touching the backing store.
    async fn drain_up_to(&self, max: usize) -> Result<Vec<RawEntry>, BufferError>;

    /// Mark drained entries as handled
    async fn acknowledge(&self, _entries: &[RawEntry]) -> Result<(), BufferError> {
        Ok(())
    }

    /// Push messages back to the head, keeping their relative order, so the
    /// first one is drained next.
    async fn requeue_front(&self, messages: Vec<BufferedMessage>) -> Result<(), BufferError>;

    async fn size(&self) -> Result<u64, BufferError>;

    /// Cheap liveness probe
    async fn is_healthy(&self) -> bool;
}

//! Pipeline Error Types
//!
//! ## Error Categories
//!
//! ### Buffer Errors ([`BufferError`])
//! - `Unavailable`: the backing store could not be reached, timed out or failed a command
//! - `Full`: the buffer holds its maximum number of entries (backpressure)
//! - `Codec`: a message could not be encoded for storage
//!
//! ### Write Errors ([`WriteError`])
//! Every failed batch write carries a [`WriteErrorKind`] that decides what the
//! failure handler does with the batch:
//! - `Transient`: retry later (connection loss, pool exhaustion, lock contention)
//! - `Integrity`: the store rejected the data; retrying the same rows cannot help
//! - `Unknown`: anything else; retried like a transient error
//!
//! ### Send Errors ([`SendError`])
//! What a caller of the send path can observe. Transient trouble with the fast
//! store is absorbed by falling back to the in-process buffer.
//!
//! ### Pipeline Errors ([`PipelineError`])
//! Assembly and startup failures.

use chatline_core::CodecError;
use chatline_store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Buffer {buffer} unavailable: {reason}")]
    Unavailable { buffer: String, reason: String },

    #[error("Buffer {buffer} full ({capacity} entries)")]
    Full { buffer: String, capacity: u64 },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl BufferError {
    pub fn unavailable(buffer: &str, reason: impl ToString) -> Self {
        BufferError::Unavailable {
            buffer: buffer.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, BufferError::Unavailable { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteErrorKind {
    Transient,
    Integrity,
    Unknown,
}

impl WriteErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteErrorKind::Transient => "transient",
            WriteErrorKind::Integrity => "integrity",
            WriteErrorKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{} write error: {message}", kind.as_str())]
pub struct WriteError {
    pub kind: WriteErrorKind,
    pub message: String,
}

impl WriteError {
    pub fn new(kind: WriteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(WriteErrorKind::Transient, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(WriteErrorKind::Integrity, message)
    }

    /// Transient and unknown failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, WriteErrorKind::Integrity)
    }
}

impl From<StoreError> for WriteError {
    fn from(e: StoreError) -> Self {
        let kind = if e.is_integrity_violation() {
            WriteErrorKind::Integrity
        } else if e.is_transient() {
            WriteErrorKind::Transient
        } else {
            WriteErrorKind::Unknown
        };
        WriteError::new(kind, e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    /// Both the primary and the fallback buffer refused the message
    #[error("Message buffers are full, try again later")]
    BufferFull,

    #[error("Message could not be encoded: {0}")]
    Encode(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

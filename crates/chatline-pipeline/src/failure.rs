//! Failure Handler
//!
//! Decides what happens to a batch after a failed write, or to buffer entries
//! that could not be decoded. It never performs I/O; the worker applies the
//! returned [`Disposition`]s.
//!
//! | Situation | Disposition |
//! |-----------|-------------|
//! | Retryable error, record under the retry limit | `RetryLater` (attempts + 1) |
//! | Retryable error, retry limit exceeded | `DeadLetter` ("retries exhausted") |
//! | Non-retryable error, several records | `Isolate` (bisect to find the poison record) |
//! | Non-retryable error, single record | `DeadLetter` |
//! | Undecodable entry | `Discard` |

use chatline_core::{codec, BufferedMessage, CodecError};
use serde::{Deserialize, Serialize};

use crate::buffer::RawEntry;
use crate::error::WriteError;

pub const RETRIES_EXHAUSTED: &str = "retries exhausted";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureConfig {
    /// Failed attempts a record may accumulate before it is dead-lettered
    pub max_retries: u32,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Push back to the head of the buffer; attempts already incremented
    RetryLater(Vec<BufferedMessage>),
    /// Give up on these records
    DeadLetter {
        messages: Vec<BufferedMessage>,
        reason: String,
    },
    /// Split and write again to find the records the store rejects
    Isolate(Vec<BufferedMessage>),
    /// Corrupt entries, never retried
    Discard {
        entries: Vec<RawEntry>,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct FailureHandler {
    config: FailureConfig,
}

impl FailureHandler {
    pub fn new(config: FailureConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    pub fn handle(&self, batch: Vec<BufferedMessage>, error: &WriteError) -> Vec<Disposition> {
        if batch.is_empty() {
            return Vec::new();
        }

        if !error.is_retryable() {
            if batch.len() > 1 {
                return vec![Disposition::Isolate(batch)];
            }
            return vec![Disposition::DeadLetter {
                messages: batch,
                reason: error.to_string(),
            }];
        }

        let (exhausted, retry): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(BufferedMessage::retried)
            .partition(|m| m.attempts > self.config.max_retries);

        let mut dispositions = Vec::with_capacity(2);
        if !retry.is_empty() {
            dispositions.push(Disposition::RetryLater(retry));
        }
        if !exhausted.is_empty() {
            dispositions.push(Disposition::DeadLetter {
                messages: exhausted,
                reason: format!("{}: {}", RETRIES_EXHAUSTED, error),
            });
        }
        dispositions
    }

    pub fn handle_corrupt(&self, entries: Vec<RawEntry>, error: &CodecError) -> Disposition {
        for entry in &entries {
            tracing::error!(
                sequence = entry.sequence,
                payload = %codec::preview(&entry.payload),
                error = %error,
                "Discarding undecodable buffer entry"
            );
        }
        Disposition::Discard {
            entries,
            reason: error.to_string(),
        }
    }
}

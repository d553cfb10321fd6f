//! Dead-Letter Sinks
//!
//! Records that will never reach the message table end up here, each exactly
//! once. A sink never fails from the caller's point of view: if the durable
//! sink cannot store a letter it logs the letter instead.

use std::sync::Arc;

use async_trait::async_trait;
use chatline_store::{DeadLetter, MessageStore};

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letters: Vec<DeadLetter>);
}

/// Logs every letter at error level
#[derive(Debug, Default, Clone)]
pub struct LogDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn record(&self, letters: Vec<DeadLetter>) {
        for letter in letters {
            tracing::error!(
                message_id = ?letter.message_id.map(|id| id.to_string()),
                chatroom_id = ?letter.chatroom_id,
                sender_id = ?letter.sender_id,
                source = %letter.source,
                attempts = letter.attempts,
                reason = %letter.reason,
                payload = %letter.payload,
                "Dead-lettered message"
            );
        }
    }
}

/// Stores letters in the `dead_letters` table, logging them if that fails
pub struct StoreDeadLetterSink {
    store: Arc<dyn MessageStore>,
    fallback: LogDeadLetterSink,
}

impl StoreDeadLetterSink {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            fallback: LogDeadLetterSink,
        }
    }
}

#[async_trait]
impl DeadLetterSink for StoreDeadLetterSink {
    async fn record(&self, letters: Vec<DeadLetter>) {
        if letters.is_empty() {
            return;
        }

        match self.store.insert_dead_letters(&letters).await {
            Ok(()) => {
                tracing::warn!(count = letters.len(), "Stored dead letters");
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    count = letters.len(),
                    "Failed to store dead letters, logging them instead"
                );
                self.fallback.record(letters).await;
            }
        }
    }
}

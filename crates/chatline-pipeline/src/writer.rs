//! Writer Strategy
//!
//! A [`MessageWriter`] persists one decoded batch to the durable store. A write
//! is all or nothing: on error no record of the batch is considered persisted.
//!
//! [`StoreWriter`] is the production strategy and adapts any
//! [`MessageStore`]. Store errors are classified into [`WriteErrorKind`]s so the
//! failure handler can tell a lost connection from a rejected record.
//!
//! [`WriteErrorKind`]: crate::error::WriteErrorKind

use std::sync::Arc;

use async_trait::async_trait;
use chatline_core::MessageRecord;
use chatline_store::MessageStore;

use crate::error::WriteError;

#[async_trait]
pub trait MessageWriter: Send + Sync {
    async fn write(&self, records: &[MessageRecord]) -> Result<(), WriteError>;

    async fn is_healthy(&self) -> bool;
}

pub struct StoreWriter {
    store: Arc<dyn MessageStore>,
}

impl StoreWriter {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageWriter for StoreWriter {
    async fn write(&self, records: &[MessageRecord]) -> Result<(), WriteError> {
        let inserted = self.store.insert_batch(records).await?;

        let skipped = records.len() as u64 - inserted.min(records.len() as u64);
        if skipped > 0 {
            // Replay of records that were already committed
            tracing::debug!(
                batch = records.len(),
                skipped = skipped,
                "Skipped already persisted messages"
            );
        }
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.store.ping().await.is_ok()
    }
}

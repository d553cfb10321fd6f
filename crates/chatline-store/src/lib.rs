//! Chatline Durable Store
//!
//! The durable store is the system of record for chat messages. Messages reach
//! it only through the batch persistence workers; senders never write here
//! directly.
//!
//! ## What Gets Stored
//!
//! | Table | Contents |
//! |-------|----------|
//! | `chat_messages` | One row per message, keyed by the time-sortable message id |
//! | `dead_letters` | Records that could not be persisted, with the reason |
//!
//! ## Guarantees
//!
//! - [`MessageStore::insert_batch`] runs in a single transaction: either every
//!   record of the batch is committed or none is.
//! - Inserts are idempotent on the message id (`ON CONFLICT (id) DO NOTHING`),
//!   so replaying a batch that was already committed leaves one row per id.
//! - `body` must be non-empty; the schema enforces it with a check constraint.
//!
//! ## Backends
//!
//! - [`SqliteMessageStore`]: single node, tests and local development
//! - `PostgresMessageStore` (feature `postgres`): shared production store
//!
//! ## Usage Example
//!
//! ```ignore
//! use chatline_store::{MessageStore, SqliteMessageStore};
//!
//! let store = SqliteMessageStore::new("chat.db").await?;
//! let inserted = store.insert_batch(&records).await?;
//! let history = store.recent_messages(room_id, 50).await?;
//! ```

use async_trait::async_trait;
use chatline_core::{MessageId, MessageRecord};

pub mod error;
pub mod store;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::{Result, StoreError};
pub use store::SqliteMessageStore;
pub use types::DeadLetter;

#[cfg(feature = "postgres")]
pub use postgres::PostgresMessageStore;

/// Durable message store
///
/// Implementations must be safe to share between both batch workers.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a batch atomically.
    ///
    /// Returns the number of rows actually inserted. Records whose id already
    /// exists are skipped and not counted. Any other failure rolls the whole
    /// batch back.
    async fn insert_batch(&self, records: &[MessageRecord]) -> Result<u64>;

    async fn get_message(&self, id: MessageId) -> Result<Option<MessageRecord>>;

    /// Latest `limit` messages of a room, oldest first
    async fn recent_messages(&self, chatroom_id: i64, limit: u32) -> Result<Vec<MessageRecord>>;

    async fn count_messages(&self) -> Result<u64>;

    async fn insert_dead_letters(&self, letters: &[DeadLetter]) -> Result<()>;

    /// Most recent dead letters, newest first
    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>>;

    /// Cheap round trip to the database
    async fn ping(&self) -> Result<()>;
}

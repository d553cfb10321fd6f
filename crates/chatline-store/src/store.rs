//! SQLite Message Store
//!
//! Single-file (or in-memory) implementation of [`MessageStore`].
//!
//! ## Usage
//!
//! ```ignore
//! // File-backed
//! let store = SqliteMessageStore::new("chat.db").await?;
//!
//! // In-memory (tests)
//! let store = SqliteMessageStore::new_in_memory().await?;
//! ```
//!
//! ## Implementation Details
//!
//! - Migrations from `./migrations` run on every open.
//! - `id`, `reply_to_id` and all timestamps are stored as `INTEGER`
//!   (timestamps in milliseconds since the Unix epoch).
//! - The in-memory variant keeps a single pooled connection that never expires,
//!   since every SQLite connection to `:memory:` opens its own database.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chatline_core::{MessageId, MessageRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::Result;
use crate::types::{millis_to_datetime, DeadLetter};
use crate::MessageStore;

/// SQLite-based message store
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true)
                .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Create in-memory database (for testing)
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_record(row: &SqliteRow) -> Result<MessageRecord> {
        let id: i64 = row.try_get("id")?;
        let reply_to: Option<i64> = row.try_get("reply_to_id")?;
        let created_at: i64 = row.try_get("created_at")?;

        Ok(MessageRecord {
            id: MessageId::from_i64(id),
            chatroom_id: row.try_get("chatroom_id")?,
            sender_id: row.try_get("sender_id")?,
            body: row.try_get("body")?,
            reply_to: reply_to.map(MessageId::from_i64),
            created_at: millis_to_datetime(created_at)?,
        })
    }

    fn row_to_dead_letter(row: &SqliteRow) -> Result<DeadLetter> {
        let message_id: Option<i64> = row.try_get("message_id")?;
        let attempts: i64 = row.try_get("attempts")?;
        let failed_at: i64 = row.try_get("failed_at")?;

        Ok(DeadLetter {
            message_id: message_id.map(MessageId::from_i64),
            chatroom_id: row.try_get("chatroom_id")?,
            sender_id: row.try_get("sender_id")?,
            payload: row.try_get("payload")?,
            reason: row.try_get("reason")?,
            attempts: attempts.clamp(0, u32::MAX as i64) as u32,
            source: row.try_get("source")?,
            failed_at: millis_to_datetime(failed_at)?,
        })
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn insert_batch(&self, records: &[MessageRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for record in records {
            let result = sqlx::query(
                "INSERT INTO chat_messages (id, chatroom_id, sender_id, body, reply_to_id, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(record.id.as_i64())
            .bind(record.chatroom_id)
            .bind(record.sender_id)
            .bind(&record.body)
            .bind(record.reply_to.map(MessageId::as_i64))
            .bind(record.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        tx.commit().await?;

        tracing::debug!(
            batch = records.len(),
            inserted = inserted,
            "Persisted message batch"
        );
        Ok(inserted)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(
            "SELECT id, chatroom_id, sender_id, body, reply_to_id, created_at
             FROM chat_messages WHERE id = ?",
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn recent_messages(&self, chatroom_id: i64, limit: u32) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            "SELECT id, chatroom_id, sender_id, body, reply_to_id, created_at
             FROM chat_messages WHERE chatroom_id = ?
             ORDER BY id DESC LIMIT ?",
        )
        .bind(chatroom_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    async fn count_messages(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn insert_dead_letters(&self, letters: &[DeadLetter]) -> Result<()> {
        if letters.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for letter in letters {
            sqlx::query(
                "INSERT INTO dead_letters
                 (message_id, chatroom_id, sender_id, payload, reason, attempts, source, failed_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(letter.message_id.map(MessageId::as_i64))
            .bind(letter.chatroom_id)
            .bind(letter.sender_id)
            .bind(&letter.payload)
            .bind(&letter.reason)
            .bind(letter.attempts as i64)
            .bind(&letter.source)
            .bind(letter.failed_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT message_id, chatroom_id, sender_id, payload, reason, attempts, source, failed_at
             FROM dead_letters ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_dead_letter).collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

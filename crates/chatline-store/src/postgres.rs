//! PostgreSQL Message Store
//!
//! Production backend shared by every node. Same semantics as the SQLite store:
//! one transaction per batch and idempotent inserts on the message id.
//!
//! Migrations live in `./migrations-postgres` and run on connect.

use std::str::FromStr;

use async_trait::async_trait;
use chatline_core::{MessageId, MessageRecord};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::error::Result;
use crate::types::{millis_to_datetime, DeadLetter};
use crate::MessageStore;

pub struct PostgresMessageStore {
    pool: PgPool,
}

impl PostgresMessageStore {
    pub async fn new(url: &str) -> Result<Self> {
        Self::with_pool_options(url, PgPoolOptions::new().max_connections(20)).await
    }

    pub async fn with_pool_options(url: &str, pool_options: PgPoolOptions) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)?;
        let pool = pool_options.connect_with(options).await?;
        sqlx::migrate!("./migrations-postgres").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_record(row: &PgRow) -> Result<MessageRecord> {
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

    fn row_to_dead_letter(row: &PgRow) -> Result<DeadLetter> {
        let message_id: Option<i64> = row.try_get("message_id")?;
        let attempts: i32 = row.try_get("attempts")?;
        let failed_at: i64 = row.try_get("failed_at")?;

        Ok(DeadLetter {
            message_id: message_id.map(MessageId::from_i64),
            chatroom_id: row.try_get("chatroom_id")?,
            sender_id: row.try_get("sender_id")?,
            payload: row.try_get("payload")?,
            reason: row.try_get("reason")?,
            attempts: attempts.max(0) as u32,
            source: row.try_get("source")?,
            failed_at: millis_to_datetime(failed_at)?,
        })
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn insert_batch(&self, records: &[MessageRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for record in records {
            let result = sqlx::query(
                "INSERT INTO chat_messages (id, chatroom_id, sender_id, body, reply_to_id, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (id) DO NOTHING",
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
             FROM chat_messages WHERE id = $1",
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn recent_messages(&self, chatroom_id: i64, limit: u32) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            "SELECT id, chatroom_id, sender_id, body, reply_to_id, created_at
             FROM chat_messages WHERE chatroom_id = $1
             ORDER BY id DESC LIMIT $2",
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
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(letter.message_id.map(MessageId::as_i64))
            .bind(letter.chatroom_id)
            .bind(letter.sender_id)
            .bind(&letter.payload)
            .bind(&letter.reason)
            .bind(letter.attempts.min(i32::MAX as u32) as i32)
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
             FROM dead_letters ORDER BY id DESC LIMIT $1",
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

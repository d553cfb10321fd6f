//! Message Record
//!
//! `MessageRecord` is the unit of persistence: one chat message as it will be
//! stored in the durable message table. It is created once by the send path and
//! never mutated afterwards.
//!
//! `BufferedMessage` wraps a record with the number of failed write attempts it
//! has seen. The counter travels with the record through requeues so the failure
//! handler can escalate to the dead-letter path after a bounded number of retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::MessageId;

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Time-sortable unique id, also the primary key
    pub id: MessageId,

    pub chatroom_id: i64,

    pub sender_id: i64,

    pub body: String,

    /// Message this one replies to, if any
    pub reply_to: Option<MessageId>,

    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Build a record whose creation time is the instant embedded in `id`
    pub fn new(
        id: MessageId,
        chatroom_id: i64,
        sender_id: i64,
        body: impl Into<String>,
        reply_to: Option<MessageId>,
    ) -> Self {
        Self {
            id,
            chatroom_id,
            sender_id,
            body: body.into(),
            reply_to,
            created_at: id.timestamp(),
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Rough in-memory footprint, used for log fields
    pub fn estimated_size(&self) -> usize {
        8 + // id
        8 + // chatroom_id
        8 + // sender_id
        self.body.len() +
        self.reply_to.map(|_| 8).unwrap_or(0) +
        12 // created_at
    }
}

/// A record as held by a buffer, with its failed-attempt counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedMessage {
    pub record: MessageRecord,
    pub attempts: u32,
}

impl BufferedMessage {
    pub fn new(record: MessageRecord) -> Self {
        Self {
            record,
            attempts: 0,
        }
    }

    /// Same message after one more failed write
    pub fn retried(mut self) -> Self {
        self.attempts = self.attempts.saturating_add(1);
        self
    }

    pub fn id(&self) -> MessageId {
        self.record.id
    }
}

impl From<MessageRecord> for BufferedMessage {
    fn from(record: MessageRecord) -> Self {
        Self::new(record)
    }
}

//! Store Data Types

use chatline_core::{codec, BufferedMessage, MessageId};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// A record that will never be persisted to `chat_messages`
///
/// Either the durable store rejected it permanently, it ran out of retries, or
/// its buffered payload could not be decoded at all. For the last case only
/// `payload` and `reason` are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: Option<MessageId>,
    pub chatroom_id: Option<i64>,
    pub sender_id: Option<i64>,

    /// Encoded buffer payload, lossily converted to text
    pub payload: String,

    pub reason: String,

    /// Failed write attempts before giving up
    pub attempts: u32,

    /// Name of the buffer the record was drained from
    pub source: String,

    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn for_message(
        message: &BufferedMessage,
        reason: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let record = &message.record;
        let payload = codec::encode(message)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(|_| record.body.clone());

        Self {
            message_id: Some(record.id),
            chatroom_id: Some(record.chatroom_id),
            sender_id: Some(record.sender_id),
            payload,
            reason: reason.into(),
            attempts: message.attempts,
            source: source.into(),
            failed_at: Utc::now(),
        }
    }

    /// Dead letter for an undecodable buffer entry
    pub fn corrupt(raw: &[u8], reason: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            message_id: None,
            chatroom_id: None,
            sender_id: None,
            payload: String::from_utf8_lossy(raw).into_owned(),
            reason: reason.into(),
            attempts: 0,
            source: source.into(),
            failed_at: Utc::now(),
        }
    }
}

pub(crate) fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::InvalidRow(format!("timestamp out of range: {}", ms)))
}

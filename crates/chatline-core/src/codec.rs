//! Buffer Wire Codec
//!
//! Every buffer stores messages in the same explicit JSON shape:
//!
//! ```json
//! {"kind":"chat","id":"0HZX3C1Y8K2QB","room":42,"sender":1001,
//!  "body":"hello","reply_to":null,"created_at":"2025-03-01T10:00:00Z","attempts":0}
//! ```
//!
//! ## Compatibility Rules
//!
//! - The payload never carries language-level type metadata. The `kind` field is
//!   an explicit discriminator; today only `"chat"` exists.
//! - Unknown fields are ignored, so newer writers can add fields without breaking
//!   older readers.
//! - `reply_to`, `created_at` and `attempts` may be absent. `created_at` then
//!   falls back to the instant embedded in the id, `attempts` to 0.
//! - Anything else (not JSON, wrong kind, bad id, missing required field) is a
//!   `CodecError::Decode`. Callers treat such entries as corrupt and never
//!   re-enqueue them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::id::MessageId;
use crate::record::{BufferedMessage, MessageRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum WireKind {
    #[serde(rename = "chat")]
    Chat,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    kind: WireKind,
    id: MessageId,
    #[serde(rename = "room")]
    chatroom_id: i64,
    #[serde(rename = "sender")]
    sender_id: i64,
    body: String,
    #[serde(default)]
    reply_to: Option<MessageId>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    attempts: u32,
}

pub fn encode(message: &BufferedMessage) -> Result<Bytes, CodecError> {
    let record = &message.record;
    let wire = WireMessage {
        kind: WireKind::Chat,
        id: record.id,
        chatroom_id: record.chatroom_id,
        sender_id: record.sender_id,
        body: record.body.clone(),
        reply_to: record.reply_to,
        created_at: Some(record.created_at),
        attempts: message.attempts,
    };

    serde_json::to_vec(&wire)
        .map(Bytes::from)
        .map_err(|source| CodecError::Encode {
            id: record.id.to_string(),
            source,
        })
}

pub fn decode(payload: &[u8]) -> Result<BufferedMessage, CodecError> {
    let wire: WireMessage =
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))?;

    let created_at = wire.created_at.unwrap_or_else(|| wire.id.timestamp());
    let record = MessageRecord {
        id: wire.id,
        chatroom_id: wire.chatroom_id,
        sender_id: wire.sender_id,
        body: wire.body,
        reply_to: wire.reply_to,
        created_at,
    };

    Ok(BufferedMessage {
        record,
        attempts: wire.attempts,
    })
}

/// Short printable prefix of a payload for log lines
pub fn preview(payload: &[u8]) -> String {
    const MAX: usize = 96;
    let end = payload.len().min(MAX);
    let mut text = String::from_utf8_lossy(&payload[..end]).into_owned();
    if payload.len() > MAX {
        text.push_str("...");
    }
    text
}

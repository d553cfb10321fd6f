//! Send Context
//!
//! Everything the send path needs about one outgoing message, gathered once per
//! request: the chatroom, the sender's profile and, for replies, a snapshot of
//! the referenced message and its author. Lookups happen before the context is
//! built, so nothing downstream has to query the chatroom or member tables again.
//! The context is dropped when the send completes.

use serde::{Deserialize, Serialize};

use crate::id::MessageId;
use crate::record::MessageRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub id: i64,
    pub display_name: String,
}

/// Snapshot of the message being replied to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub message_id: MessageId,
    pub sender_id: i64,
    pub sender_name: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendContext {
    pub chatroom_id: i64,
    pub sender: SenderProfile,
    pub reply: Option<ReplyPreview>,
}

impl SendContext {
    pub fn new(chatroom_id: i64, sender: SenderProfile) -> Self {
        Self {
            chatroom_id,
            sender,
            reply: None,
        }
    }

    pub fn replying_to(mut self, reply: ReplyPreview) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn to_record(&self, id: MessageId, body: impl Into<String>) -> MessageRecord {
        MessageRecord::new(
            id,
            self.chatroom_id,
            self.sender.id,
            body,
            self.reply.as_ref().map(|r| r.message_id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdGenerator;

    #[test]
    fn test_to_record_carries_reply_target() {
        let ids = IdGenerator::new(0).unwrap();
        let original = ids.next_id();
        let ctx = SendContext::new(
            12,
            SenderProfile {
                id: 5,
                display_name: "mia".to_string(),
            },
        )
        .replying_to(ReplyPreview {
            message_id: original,
            sender_id: 6,
            sender_name: "leo".to_string(),
            excerpt: "see you at".to_string(),
        });

        let record = ctx.to_record(ids.next_id(), "on my way");
        assert_eq!(record.chatroom_id, 12);
        assert_eq!(record.sender_id, 5);
        assert_eq!(record.reply_to, Some(original));
    }
}

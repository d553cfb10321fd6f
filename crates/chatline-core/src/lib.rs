//! Chatline Core
//!
//! Shared building blocks for the chat persistence pipeline:
//!
//! - [`MessageId`] / [`IdGenerator`]: 64-bit, time-sortable identifiers that need
//!   no coordination between processes (only a distinct node id per process)
//! - [`MessageRecord`]: the immutable chat message that flows from the send path
//!   through the buffers into the durable store
//! - [`BufferedMessage`]: a record plus its failed-write counter, the unit the
//!   buffers hold
//! - [`SendContext`]: request-scoped data gathered once per send
//! - [`codec`]: the explicit JSON wire format used by every buffer
//!
//! ## Example
//! ```ignore
//! use chatline_core::{IdGenerator, MessageRecord, codec};
//!
//! let ids = IdGenerator::new(7)?;
//! let record = MessageRecord::new(ids.next_id(), 42, 1001, "hello", None);
//! let bytes = codec::encode(&record.clone().into())?;
//! let decoded = codec::decode(&bytes)?;
//! assert_eq!(decoded.record, record);
//! ```

pub mod codec;
pub mod context;
pub mod error;
pub mod id;
pub mod record;

pub use context::{ReplyPreview, SendContext, SenderProfile};
pub use error::{CodecError, Error, IdError, Result};
pub use id::{IdGenerator, MessageId};
pub use record::{BufferedMessage, MessageRecord};

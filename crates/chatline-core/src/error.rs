//! Error Types for Chatline Core
//!
//! ### Identifier Errors
//! - `NodeOutOfRange`: node discriminator does not fit in the configured node bits
//! - `AlreadyInitialized`: the process-wide generator was configured twice
//! - `InvalidFormat`: a textual id is not 13 Crockford base32 characters
//!
//! ### Codec Errors
//! - `Encode`: a message could not be serialized
//! - `Decode`: a buffer entry is structurally invalid (treated as corrupt)

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("Node id {node} out of range (max {max})")]
    NodeOutOfRange { node: u16, max: u16 },

    #[error("Global id generator already initialized")]
    AlreadyInitialized,

    #[error("Invalid message id: {0}")]
    InvalidFormat(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode message {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Corrupt buffer entry: {0}")]
    Decode(String),
}

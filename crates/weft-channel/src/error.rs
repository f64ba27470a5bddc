//! Error types for the channel store.

use thiserror::Error;
use weft_core::{ChainError, ChannelId, CoreError, MessageHash, Timestamp};

/// Errors from constructing, posting to, or receiving into a channel.
///
/// Each validation failure rejects one message and leaves the store as it
/// was.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    #[error("channel name is {len} bytes, maximum is {max}")]
    NameTooLong { len: usize, max: usize },

    #[error("invalid channel public key")]
    InvalidPublicKey,

    #[error("root message must be encrypted")]
    RootMustBeEncrypted,

    #[error("invalid root message: {0}")]
    InvalidRoot(&'static str),

    #[error("incoming message is not encrypted")]
    IncomingMessageNotEncrypted,

    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] ChainError),

    #[error("envelope error: {0}")]
    Envelope(#[from] CoreError),

    /// No parents on a message other than the root, or more than
    /// [`MAX_PARENTS`](crate::MAX_PARENTS).
    #[error("invalid parent count")]
    InvalidParentCount,

    #[error("parent not found: {0}")]
    ParentNotFound(MessageHash),

    #[error("invalid height: expected {expected}, got {got}")]
    InvalidHeight { expected: u64, got: u64 },

    #[error("invalid timestamp {timestamp}: must be at least {min} and before {max}")]
    InvalidTimestamp {
        timestamp: Timestamp,
        min: Timestamp,
        max: Timestamp,
    },

    #[error("parent timestamps span {spread}s, more than {max}s")]
    ParentTooFarInThePast { spread: Timestamp, max: Timestamp },

    #[error("no chain found for channel {0}")]
    NoChainFound(ChannelId),

    #[error("unknown cursor: {0}")]
    UnknownCursor(MessageHash),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

//! Error types for identities and invites.

use thiserror::Error;
use weft_core::{ChainError, ChannelId, CoreError};

/// Errors from identity and invite operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IdentityError {
    #[error("trust chain error: {0}")]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("no chain found for channel {0}")]
    NoChainFound(ChannelId),

    #[error("stored public key does not match the secret key")]
    KeyMismatch,

    #[error("invalid invite request: {0}")]
    InvalidRequest(&'static str),

    #[error("invite chain does not end at this identity")]
    NotForThisIdentity,

    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Result type for identity operations.
pub type Result<T> = std::result::Result<T, IdentityError>;

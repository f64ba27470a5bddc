//! Error types for Weft Core.

use thiserror::Error;

/// Errors from key handling, envelopes, and message decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("unsupported envelope format: {0}")]
    UnsupportedFormat(u8),

    #[error("envelope truncated: {0} bytes")]
    TruncatedEnvelope(usize),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("envelope nonce does not match its content")]
    NonceMismatch,

    #[error("message is not canonically encoded")]
    NonCanonical,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Trust chain violations.
///
/// Index fields refer to the position of the offending link in the chain.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChainError {
    #[error("chain has {len} links, maximum is {max}")]
    TooLong { len: usize, max: usize },

    #[error("link {index} expired at {expiration} (timestamp {timestamp})")]
    LinkExpired {
        index: usize,
        expiration: f64,
        timestamp: f64,
    },

    #[error("link {index} is not signed by the previous trustee")]
    LinkSignatureMismatch { index: usize },

    #[error("content signature does not verify against the chain's final trustee")]
    ContentSignatureMismatch,
}

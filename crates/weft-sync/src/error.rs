//! Error types for the sync module.

use thiserror::Error;
use weft_channel::ChannelError;
use weft_core::{MessageHash, PeerId};

use crate::messages::ErrorCode;

/// A peer broke the query/bulk contract. The session with that peer ends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("query response has {got} entries, maximum is {max}")]
    OversizedQueryResponse { got: usize, max: usize },

    #[error("bulk response has {got} messages for {requested} requested hashes")]
    OversizedBulkResponse { got: usize, requested: usize },

    #[error("bulk response contains unrequested message {0}")]
    UnrequestedHash(MessageHash),

    #[error("bulk forward index {index} is invalid for {requested} requested hashes")]
    InvalidForwardIndex { index: u32, requested: usize },

    #[error("query window has missing parents but no backward cursor")]
    MissingBackwardCursor,

    #[error("unexpected {0} response")]
    UnexpectedResponse(&'static str),

    #[error("packet exceeds limits: {0}")]
    LimitExceeded(&'static str),
}

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] Violation),

    /// A fetched message failed local validation.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("transport error: {0}")]
    TransportError(String),

    /// Peer answered with an error packet.
    #[error("peer error ({code:?}): {message}")]
    PeerError { code: ErrorCode, message: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("peer not connected: {0}")]
    PeerNotConnected(PeerId),
}

impl SyncError {
    /// Whether this error ends the session because of the peer's behavior.
    pub fn is_violation(&self) -> bool {
        matches!(self, SyncError::ProtocolViolation(_))
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

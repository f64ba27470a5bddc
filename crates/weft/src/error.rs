//! Error types for the node coordinator.

use thiserror::Error;
use weft_channel::ChannelError;
use weft_core::{ChannelId, PeerId};
use weft_identity::IdentityError;
use weft_store::StoreError;
use weft_sync::SyncError;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// A sync session ended early.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("identity already exists: {0}")]
    IdentityExists(String),

    #[error("identity not found: {0}")]
    IdentityNotFound(String),

    /// Each identity owns at most one channel, keyed by its public key.
    #[error("channel already exists: {0}")]
    ChannelExists(ChannelId),

    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("invite from {0} matches no pending request")]
    NoMatchingInvite(PeerId),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

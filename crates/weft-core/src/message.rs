//! Channel messages.
//!
//! A [`ChannelMessage`] is a node in a channel's DAG. Its [`Content`] is
//! signed by the final trustee of the embedded chain, over the content
//! fields together with the message's parents and height, so a message
//! cannot be re-parented without invalidating its signature.

use crate::canonical::{self, content_signing_bytes};
use crate::chain::Chain;
use crate::crypto::{ChannelKey, Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::envelope::MessageEnvelope;
use crate::error::{ChainError, CoreError};
use crate::types::{ChannelId, MessageHash, Timestamp};

/// Maximum age of a parent relative to its child: 30 days in seconds.
pub const MAX_PARENT_DELTA: Timestamp = 30.0 * 24.0 * 3600.0;

/// Tolerated clock skew for timestamps from the future, in seconds.
pub const FUTURE_SKEW: Timestamp = 10.0;

/// Message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Marker carried only by a channel's root message.
    Root,
    /// A text post.
    Text(String),
}

impl Body {
    pub fn text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            Body::Root => None,
        }
    }
}

/// Authored part of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub chain: Chain,
    pub timestamp: Timestamp,
    pub body: Body,
    pub signature: Ed25519Signature,
}

impl Content {
    /// Sign content for a message at `height` with `parents`.
    pub fn sign(
        signer: &Keypair,
        chain: Chain,
        timestamp: Timestamp,
        body: Body,
        parents: &[MessageHash],
        height: u64,
    ) -> Self {
        let bytes = content_signing_bytes(&chain, timestamp, &body, parents, height);
        let signature = signer.sign(&bytes);
        Self {
            chain,
            timestamp,
            body,
            signature,
        }
    }
}

/// A node in the channel DAG.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub content: Content,
    pub height: u64,
    pub parents: Vec<MessageHash>,
}

impl ChannelMessage {
    pub fn new(content: Content, height: u64, parents: Vec<MessageHash>) -> Self {
        Self {
            content,
            height,
            parents,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.content.timestamp
    }

    pub fn body(&self) -> &Body {
        &self.content.body
    }

    /// Check the chain and content signature.
    ///
    /// The chain is evaluated at the message's own timestamp.
    pub fn verify(
        &self,
        channel_public_key: &Ed25519PublicKey,
        channel_id: &ChannelId,
    ) -> Result<(), ChainError> {
        let content = &self.content;
        let signer = content
            .chain
            .verify(channel_public_key, channel_id, content.timestamp)?;

        let bytes = content_signing_bytes(
            &content.chain,
            content.timestamp,
            &content.body,
            &self.parents,
            self.height,
        );
        signer
            .verify(&bytes, &content.signature)
            .map_err(|_| ChainError::ContentSignatureMismatch)
    }

    /// Canonical encoding (envelope plaintext).
    pub fn to_bytes(&self) -> Vec<u8> {
        canonical::message_bytes(self)
    }

    /// Decode from canonical bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        canonical::decode_message(bytes)
    }

    /// Encrypt into an envelope under the channel key.
    pub fn seal(&self, key: &ChannelKey) -> Result<MessageEnvelope, CoreError> {
        MessageEnvelope::seal(key, &self.to_bytes())
    }
}

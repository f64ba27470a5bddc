//! # Weft Core
//!
//! Pure primitives for Weft: channel messages, trust chains, and the
//! encodings that make message hashes stable across peers.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`ChannelMessage`] - A signed node in a channel's message DAG
//! - [`MessageEnvelope`] - The encrypted wire form whose hash addresses a message
//! - [`MessageHash`] - Content address of an envelope (Blake3)
//! - [`ChannelId`] - Identifier derived one-way from the channel public key
//! - [`Chain`] / [`Link`] - Delegation certificates granting posting rights
//!
//! ## Canonicalization
//!
//! Everything that is hashed or signed is encoded as deterministic CBOR.
//! See the [`canonical`] module.

pub mod canonical;
pub mod chain;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod message;
pub mod types;

pub use chain::{Chain, Link, DEFAULT_LINK_TTL, MAX_CHAIN_LENGTH};
pub use crypto::{constant_time_eq, Blake3Hash, ChannelKey, Ed25519PublicKey, Ed25519Signature, Keypair};
pub use envelope::{EnvelopeFormat, MessageEnvelope};
pub use error::{ChainError, CoreError};
pub use message::{Body, ChannelMessage, Content, FUTURE_SKEW, MAX_PARENT_DELTA};
pub use types::{now, ChannelId, MessageHash, PeerId, Timestamp};

//! # Weft
//!
//! Peer-to-peer group messaging over encrypted, signed message DAGs.
//!
//! ## Overview
//!
//! - **Channels**: a DAG of messages rooted at a message signed by the
//!   channel key, kept in canonical `(height, hash)` order
//! - **Trust chains**: delegation links from the channel key to each poster
//! - **Invites**: a chain extended to a new member and boxed to its key
//! - **Sync**: peers pull what they are missing with query/bulk requests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use weft::{Node, NodeConfig};
//! use weft::store::SqliteStore;
//!
//! async fn example() -> weft::Result<()> {
//!     let store = SqliteStore::open("weft.db")?;
//!     let mut node = Node::create("alice", store, NodeConfig::default()).await?;
//!
//!     let channel_id = node.create_channel("general").await?;
//!     let (_hash, notifications) = node.post_text(&channel_id, "hello").await?;
//!
//!     // Hand `notifications` to a transport, then keep answering peers:
//!     // weft::send_all(&transport, notifications).await?;
//!     // node.drive(&transport).await?;
//!     # let _ = notifications;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `weft::core` - hashes, keys, messages, trust chains
//! - `weft::store` - key/value persistence
//! - `weft::identity` - identities and invites
//! - `weft::channel` - the channel store
//! - `weft::sync` - packets, sync driver, transports

pub mod config;
pub mod error;
pub mod node;

pub use weft_channel as channel;
pub use weft_core as core;
pub use weft_identity as identity;
pub use weft_store as store;
pub use weft_sync as sync;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::{send_all, Node, Outgoing};

pub use weft_channel::{Channel, ChannelEvent, EventOrigin, ReceiveResult};
pub use weft_core::{Body, ChannelId, MessageHash, PeerId};
pub use weft_identity::{Identity, InviteRequest};
pub use weft_sync::{ChannelDigest, Packet, SyncConfig, SyncReport, Transport};

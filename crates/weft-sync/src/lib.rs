//! # Weft Sync
//!
//! Pull-based sync for channel replicas.
//!
//! ## Overview
//!
//! A peer that learns a channel changed pulls from the peer that told it.
//! It walks the remote canonical order with `Query` packets and fetches
//! the messages it can append with `Bulk` packets. Nothing is pushed and
//! no session state survives a reconnect: restarting from scratch is
//! always safe because both sides only compare stored messages.
//!
//! ## Key Properties
//!
//! - **Idempotent**: re-fetching a stored message is a duplicate, not an error
//! - **Parents first**: a message is fetched only once its parents are known
//! - **Bounded**: every window and bulk response is capped at [`SYNC_LIMIT`]
//! - **Peer-isolated**: a protocol violation ends one session, nothing else
//!
//! ## Packet Flow
//!
//! ```text
//! Node A                                   Node B
//!   |-------- Notification(channel) -------->|
//!   |<------- Query(height, forward) --------|
//!   |-------- QueryResponse ---------------->|
//!   |<------- Bulk(committable hashes) ------|
//!   |-------- BulkResponse ----------------->|
//!   |<------- Query(next cursor) ------------|
//!   |                 ...                    |
//! ```
//!
//! [`SyncDriver`] is the initiator's state machine. It performs no I/O, so
//! the coordinator owning the channel drives it with whatever
//! [`Transport`] it has.

pub mod convergence;
pub mod error;
pub mod messages;
pub mod protocol;
pub mod transport;

pub use convergence::{order_hash, verify_convergence, ChannelDigest, ConvergenceResult};
pub use error::{Result, SyncError, Violation};
pub use messages::{limits, ErrorCode, Packet, PROTOCOL_VERSION};
pub use protocol::{SyncAction, SyncConfig, SyncDriver, SyncOutcome, SyncReport};
pub use transport::memory::{MemoryNetwork, MemoryTransport};
pub use transport::Transport;
pub use weft_channel::SYNC_LIMIT;

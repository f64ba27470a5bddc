//! # Weft Channel
//!
//! One channel's message DAG.
//!
//! A [`Channel`] validates and appends messages, keeps them in canonical
//! `(height, hash)` order, tracks the leaf set that new posts build on, and
//! answers the `query` / `bulk` requests peers use to sync.
//!
//! The store does no locking. Callers serialize all access, typically by
//! owning the channel inside a single coordinator.

pub mod channel;
pub mod error;
pub mod events;
pub mod query;
pub mod snapshot;

pub use channel::{Channel, ReceiveResult, StoredMessage, MAX_NAME_LEN, MAX_PARENTS};
pub use error::{ChannelError, Result};
pub use events::{ChannelEvent, EventOrigin};
pub use query::{
    AbbreviatedMessage, BulkRequest, BulkResponse, Cursor, QueryRequest, QueryResponse, SYNC_LIMIT,
};
pub use snapshot::ChannelSnapshot;

//! Query and bulk request/response types.
//!
//! These are what a channel store answers for a syncing peer: `query`
//! walks the canonical order and returns hashes with their parents, `bulk`
//! returns full envelopes for hashes the peer chose to fetch.

use serde::{Deserialize, Serialize};
use weft_core::{MessageEnvelope, MessageHash};

/// Maximum entries in a query window and messages in a bulk response.
pub const SYNC_LIMIT: usize = 128;

/// Position in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cursor {
    /// First message at this height, clamped to the lowest leaf height.
    Height(u64),
    /// A specific stored message.
    Hash(MessageHash),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub cursor: Cursor,
    pub is_backward: bool,
    pub limit: u32,
}

impl QueryRequest {
    pub fn forward(cursor: Cursor) -> Self {
        Self {
            cursor,
            is_backward: false,
            limit: SYNC_LIMIT as u32,
        }
    }

    pub fn backward(cursor: Cursor) -> Self {
        Self {
            cursor,
            is_backward: true,
            limit: SYNC_LIMIT as u32,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }
}

/// A message reduced to what the query phase needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbbreviatedMessage {
    pub hash: MessageHash,
    pub parents: Vec<MessageHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Window entries in canonical order.
    pub abbreviated: Vec<AbbreviatedMessage>,
    /// The entry just past the window, if any.
    pub forward_hash: Option<MessageHash>,
    /// The window's first entry, if any.
    pub backward_hash: Option<MessageHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRequest {
    pub hashes: Vec<MessageHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResponse {
    /// Envelopes in request order; unknown hashes are skipped.
    pub messages: Vec<MessageEnvelope>,
    /// How many of the requested hashes were consumed.
    pub forward_index: u32,
}

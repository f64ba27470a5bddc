//! Wire packets exchanged between peers.
//!
//! Every packet is CBOR-encoded with `ciborium`. Requests carry a
//! `request_id` chosen by the initiator and echoed in the response.

use serde::{Deserialize, Serialize};

use weft_channel::{
    BulkRequest, BulkResponse, QueryRequest, QueryResponse, MAX_PARENTS, SYNC_LIMIT,
};
use weft_core::ChannelId;

use crate::error::{Result, SyncError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0;

/// Packet size limits.
pub mod limits {
    use super::{MAX_PARENTS, SYNC_LIMIT};

    /// Max hashes in a bulk request.
    pub const MAX_BULK_HASHES: usize = SYNC_LIMIT;
    /// Max parents listed per abbreviated entry. Matches what a channel
    /// accepts, so every stored message fits in a response.
    pub const MAX_PARENTS_PER_ENTRY: usize = MAX_PARENTS;
    /// Max bytes of an encrypted invite.
    pub const MAX_INVITE_BYTES: usize = 64 * 1024;
    /// Max bytes of an error description.
    pub const MAX_ERROR_MESSAGE_BYTES: usize = 1024;
}

/// Sync protocol packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// A channel gained messages; the receiver may start a sync.
    Notification { channel_id: ChannelId },

    Query {
        request_id: u64,
        channel_id: ChannelId,
        request: QueryRequest,
    },

    QueryResponse {
        request_id: u64,
        response: QueryResponse,
    },

    Bulk {
        request_id: u64,
        channel_id: ChannelId,
        request: BulkRequest,
    },

    BulkResponse {
        request_id: u64,
        response: BulkResponse,
    },

    /// A boxed invite, readable only by the requester.
    Invite { encrypted_chain: Vec<u8> },

    /// The responder could not answer a request.
    Error {
        request_id: u64,
        code: ErrorCode,
        message: String,
    },
}

impl Packet {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Notification { .. } => "notification",
            Packet::Query { .. } => "query",
            Packet::QueryResponse { .. } => "query_response",
            Packet::Bulk { .. } => "bulk",
            Packet::BulkResponse { .. } => "bulk_response",
            Packet::Invite { .. } => "invite",
            Packet::Error { .. } => "error",
        }
    }

    /// The request id of a request, response or error packet.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Packet::Query { request_id, .. }
            | Packet::QueryResponse { request_id, .. }
            | Packet::Bulk { request_id, .. }
            | Packet::BulkResponse { request_id, .. }
            | Packet::Error { request_id, .. } => Some(*request_id),
            Packet::Notification { .. } | Packet::Invite { .. } => None,
        }
    }

    /// Check request-side size limits.
    ///
    /// Response sizes are checked by the driver against what it asked for.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        match self {
            Packet::Bulk { request, .. } => {
                if request.hashes.len() > limits::MAX_BULK_HASHES {
                    return Err("too many hashes in bulk request");
                }
            }
            Packet::QueryResponse { response, .. } => {
                if response
                    .abbreviated
                    .iter()
                    .any(|entry| entry.parents.len() > limits::MAX_PARENTS_PER_ENTRY)
                {
                    return Err("too many parents in query entry");
                }
            }
            Packet::Invite { encrypted_chain } => {
                if encrypted_chain.len() > limits::MAX_INVITE_BYTES {
                    return Err("invite too large");
                }
            }
            Packet::Error { message, .. } => {
                if message.len() > limits::MAX_ERROR_MESSAGE_BYTES {
                    return Err("error message too long");
                }
            }
            Packet::Notification { .. } | Packet::Query { .. } | Packet::BulkResponse { .. } => {}
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

/// Error codes carried by [`Packet::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// The responder does not hold the channel.
    UnknownChannel = 1,
    /// A hash cursor names no stored message.
    UnknownCursor = 2,
    /// The request broke packet limits or protocol rules.
    ProtocolViolation = 3,
    /// Internal error on the responder.
    Internal = 4,
}

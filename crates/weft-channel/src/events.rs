//! Channel events for subscribers.

use weft_core::{ChannelId, ChannelMessage, MessageHash};

/// Where an appended message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Posted by the local identity.
    Local,
    /// Received from a peer.
    Remote,
}

/// Emitted after a message is appended.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub channel_id: ChannelId,
    pub hash: MessageHash,
    pub message: ChannelMessage,
    pub origin: EventOrigin,
}

/// Buffered events per subscriber before lagging receivers drop old ones.
pub const EVENT_CAPACITY: usize = 256;

//! Convergence verification.
//!
//! Two replicas of a channel have converged when they hold the same
//! messages. A [`ChannelDigest`] summarizes a replica so that can be
//! checked without exchanging the messages themselves.

use serde::{Deserialize, Serialize};

use weft_channel::Channel;
use weft_core::{Blake3Hash, ChannelId, MessageHash};

const ORDER_DOMAIN: &[u8] = b"weft-order-v0:";

/// Summary of a channel replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDigest {
    pub channel_id: ChannelId,
    pub message_count: usize,
    /// Sorted leaf set.
    pub leaves: Vec<MessageHash>,
    pub order_hash: Blake3Hash,
}

impl ChannelDigest {
    pub fn compute(channel: &Channel) -> Self {
        Self {
            channel_id: *channel.channel_id(),
            message_count: channel.len(),
            leaves: channel.leaves(),
            order_hash: order_hash(channel),
        }
    }
}

/// Rolling hash over the canonical order.
///
/// H = Blake3(domain || channel id || hash_0 || hash_1 || ...)
pub fn order_hash(channel: &Channel) -> Blake3Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ORDER_DOMAIN);
    hasher.update(channel.channel_id().as_bytes());
    for stored in channel.messages() {
        hasher.update(stored.hash.as_bytes());
    }
    Blake3Hash(*hasher.finalize().as_bytes())
}

/// Compare two replicas' digests.
pub fn verify_convergence(local: &ChannelDigest, remote: &ChannelDigest) -> ConvergenceResult {
    if local.channel_id != remote.channel_id {
        return ConvergenceResult::NotConverged {
            reason: format!(
                "different channels: local={}, remote={}",
                local.channel_id, remote.channel_id
            ),
        };
    }

    if local.message_count != remote.message_count {
        return ConvergenceResult::NotConverged {
            reason: format!(
                "message count mismatch: local={}, remote={}",
                local.message_count, remote.message_count
            ),
        };
    }

    if local.leaves != remote.leaves {
        return ConvergenceResult::NotConverged {
            reason: "leaf sets differ".into(),
        };
    }

    if local.order_hash != remote.order_hash {
        return ConvergenceResult::NotConverged {
            reason: "order hash mismatch".into(),
        };
    }

    ConvergenceResult::Converged
}

/// Result of convergence verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceResult {
    Converged,
    /// More sync rounds may be needed.
    NotConverged { reason: String },
}

impl ConvergenceResult {
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged)
    }
}

//! Node configuration.

use std::time::Duration;

use weft_core::{Timestamp, DEFAULT_LINK_TTL};
use weft_sync::SyncConfig;

/// Configuration for a [`Node`](crate::Node).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub sync: SyncConfig,
    /// Lifetime of links issued in invites, in seconds.
    pub link_ttl: Timestamp,
    /// Start a sync when a peer announces new messages.
    pub auto_sync_on_notification: bool,
    /// [`Node::drive`](crate::Node::drive) returns after this long without
    /// an inbound packet.
    pub idle_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            link_ttl: DEFAULT_LINK_TTL,
            auto_sync_on_notification: true,
            idle_timeout: Duration::from_millis(500),
        }
    }
}

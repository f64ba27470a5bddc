//! Persisted channel form.

use serde::{Deserialize, Serialize};
use weft_core::{Ed25519PublicKey, MessageEnvelope};

use crate::error::{ChannelError, Result};

/// Everything needed to rebuild a channel: the root plus every other
/// envelope in canonical order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub public_key: Ed25519PublicKey,
    pub name: String,
    pub root: MessageEnvelope,
    pub messages: Vec<MessageEnvelope>,
}

impl ChannelSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| ChannelError::Snapshot(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| ChannelError::Snapshot(e.to_string()))
    }
}

//! Identities: a named signing keypair and the chains it posts through.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use weft_core::crypto::byte_array;
use weft_core::{
    now, Body, Chain, ChannelId, Content, Ed25519PublicKey, Keypair, Link, MessageHash, Timestamp,
    DEFAULT_LINK_TTL,
};

use crate::error::{IdentityError, Result};

/// A posting identity.
///
/// The chain map only grows: joining a channel adds or replaces its chain,
/// nothing removes one.
#[derive(Debug, Clone)]
pub struct Identity {
    name: String,
    keypair: Keypair,
    chains: HashMap<ChannelId, Chain>,
}

impl Identity {
    /// Create an identity with a fresh keypair.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::from_keypair(name, Keypair::generate())
    }

    pub fn from_keypair(name: impl Into<String>, keypair: Keypair) -> Self {
        Self {
            name: name.into(),
            keypair,
            chains: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        self.keypair.public_key()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Issue a link granting `trustee` posting rights on `channel_id`.
    ///
    /// Without an explicit expiration the link lasts [`DEFAULT_LINK_TTL`].
    pub fn issue_link(
        &self,
        trustee: Ed25519PublicKey,
        channel_id: &ChannelId,
        expiration: Option<Timestamp>,
    ) -> Link {
        let expiration = expiration.unwrap_or_else(|| now() + DEFAULT_LINK_TTL);
        Link::issue(&self.keypair, trustee, expiration, channel_id)
    }

    /// The chain this identity posts through on a channel owned by `owner`.
    ///
    /// The owner needs no delegation and gets the empty chain.
    pub fn chain_for(&self, channel_id: &ChannelId, owner: &Ed25519PublicKey) -> Option<Chain> {
        if self.public_key() == *owner {
            return Some(Chain::empty());
        }
        self.chains.get(channel_id).cloned()
    }

    /// Register (or replace) the chain for a channel.
    pub fn add_chain(&mut self, channel_id: ChannelId, chain: Chain) {
        tracing::debug!(identity = %self.name, channel = %channel_id, links = chain.len(), "registered chain");
        self.chains.insert(channel_id, chain);
    }

    /// Channels this identity holds a delegated chain for.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelId> {
        self.chains.keys()
    }

    /// Sign content binding the chain and the message's DAG position.
    pub fn sign_content(
        &self,
        chain: Chain,
        timestamp: Timestamp,
        body: Body,
        parents: &[MessageHash],
        height: u64,
    ) -> Content {
        Content::sign(&self.keypair, chain, timestamp, body, parents, height)
    }

    pub fn to_record(&self) -> IdentityRecord {
        let mut channel_chains: Vec<ChannelChain> = self
            .chains
            .iter()
            .map(|(channel_id, chain)| ChannelChain {
                channel_id: *channel_id,
                links: chain.links().to_vec(),
            })
            .collect();
        channel_chains.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));

        IdentityRecord {
            name: self.name.clone(),
            secret_key: self.keypair.seed(),
            public_key: self.public_key(),
            channel_chains,
        }
    }

    /// Restore from a record, checking the key pair is consistent.
    pub fn from_record(record: IdentityRecord) -> Result<Self> {
        let keypair = Keypair::from_seed(&record.secret_key);
        if keypair.public_key() != record.public_key {
            return Err(IdentityError::KeyMismatch);
        }

        let chains = record
            .channel_chains
            .into_iter()
            .map(|cc| (cc.channel_id, Chain::from_links(cc.links)))
            .collect();

        Ok(Self {
            name: record.name,
            keypair,
            chains,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(&self.to_record(), &mut buf)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record: IdentityRecord = ciborium::from_reader(bytes)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))?;
        Self::from_record(record)
    }
}

/// Persisted identity.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub name: String,
    #[serde(with = "byte_array")]
    pub secret_key: [u8; 32],
    pub public_key: Ed25519PublicKey,
    pub channel_chains: Vec<ChannelChain>,
}

impl std::fmt::Debug for IdentityRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRecord")
            .field("name", &self.name)
            .field("public_key", &self.public_key)
            .field("channel_chains", &self.channel_chains.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelChain {
    pub channel_id: ChannelId,
    pub links: Vec<Link>,
}

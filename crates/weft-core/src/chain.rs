//! Trust chains.
//!
//! A [`Link`] is a certificate in which one key (the issuer) grants another
//! (the trustee) the right to post to a channel until an expiration time.
//! A [`Chain`] is an ordered list of links rooted at the channel key: the
//! first link is signed by the channel owner, each later link by the
//! previous link's trustee. The final trustee is the key that signs content.

use serde::{Deserialize, Serialize};

use crate::canonical::link_signing_bytes;
use crate::crypto::{Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::error::ChainError;
use crate::types::{ChannelId, Timestamp};

/// Maximum number of links in a chain.
pub const MAX_CHAIN_LENGTH: usize = 5;

/// Default lifetime of a newly issued link: 99 days.
pub const DEFAULT_LINK_TTL: Timestamp = 99.0 * 24.0 * 3600.0;

/// A delegation certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub trustee: Ed25519PublicKey,
    pub expiration: Timestamp,
    pub signature: Ed25519Signature,
}

impl Link {
    /// Issue a link from `issuer` to `trustee` for `channel_id`.
    pub fn issue(
        issuer: &Keypair,
        trustee: Ed25519PublicKey,
        expiration: Timestamp,
        channel_id: &ChannelId,
    ) -> Self {
        let signature = issuer.sign(&link_signing_bytes(&trustee, expiration, channel_id));
        Self {
            trustee,
            expiration,
            signature,
        }
    }

    /// Whether the link is still valid at `timestamp`.
    pub fn is_valid_at(&self, timestamp: Timestamp) -> bool {
        self.expiration > timestamp
    }

    fn verify_signature(&self, issuer: &Ed25519PublicKey, channel_id: &ChannelId) -> bool {
        let bytes = link_signing_bytes(&self.trustee, self.expiration, channel_id);
        issuer.verify(&bytes, &self.signature).is_ok()
    }
}

/// An ordered delegation path from a channel key to a posting key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    links: Vec<Link>,
}

impl Chain {
    /// The empty chain: the channel key itself is the signer.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_links(links: Vec<Link>) -> Self {
        Self { links }
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// The key at the end of the chain, or `owner` for the empty chain.
    pub fn final_trustee(&self, owner: &Ed25519PublicKey) -> Ed25519PublicKey {
        self.links.last().map(|l| l.trustee).unwrap_or(*owner)
    }

    /// A copy of this chain with `link` appended.
    pub fn extended(&self, link: Link) -> Result<Self, ChainError> {
        let len = self.links.len() + 1;
        if len > MAX_CHAIN_LENGTH {
            return Err(ChainError::TooLong {
                len,
                max: MAX_CHAIN_LENGTH,
            });
        }
        let mut links = self.links.clone();
        links.push(link);
        Ok(Self { links })
    }

    /// Verify the chain and return the key authorized to sign content.
    ///
    /// Every link must be unexpired at `timestamp` and signed by the
    /// previous signer, starting from `owner`.
    pub fn verify(
        &self,
        owner: &Ed25519PublicKey,
        channel_id: &ChannelId,
        timestamp: Timestamp,
    ) -> Result<Ed25519PublicKey, ChainError> {
        if self.links.len() > MAX_CHAIN_LENGTH {
            return Err(ChainError::TooLong {
                len: self.links.len(),
                max: MAX_CHAIN_LENGTH,
            });
        }

        let mut signer = *owner;
        for (index, link) in self.links.iter().enumerate() {
            if !link.is_valid_at(timestamp) {
                return Err(ChainError::LinkExpired {
                    index,
                    expiration: link.expiration,
                    timestamp,
                });
            }
            if !link.verify_signature(&signer, channel_id) {
                return Err(ChainError::LinkSignatureMismatch { index });
            }
            signer = link.trustee;
        }
        Ok(signer)
    }
}

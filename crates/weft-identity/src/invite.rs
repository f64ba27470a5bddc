//! Invites: handing a channel and a posting chain to a new member.
//!
//! The inviter extends its own chain with a link to the requester and
//! seals the channel's key material, root and chain to the requester's
//! box key using X25519 + ChaCha20-Poly1305.

use serde::{Deserialize, Serialize};
use weft_core::{
    Chain, ChannelId, Ed25519PublicKey, MessageEnvelope, PeerId, Timestamp,
};

use crate::crypto::{EncryptionNonce, EphemeralKeyPair, X25519PublicKey, X25519StaticSecret};
use crate::error::{IdentityError, Result};
use crate::identity::Identity;

/// Domain separation for the invite box key.
const INVITE_CONTEXT: &[u8] = b"weft-invite-v0:";

/// Out-of-band request to be invited, e.g. shown as a QR code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteRequest {
    pub trustee_public_key: Ed25519PublicKey,
    pub box_public_key: X25519PublicKey,
    pub peer_id: PeerId,
}

impl InviteRequest {
    /// Create a request for `identity`, returning the box secret that opens
    /// the eventual invite.
    pub fn new(identity: &Identity, peer_id: PeerId) -> (Self, X25519StaticSecret) {
        let secret = X25519StaticSecret::generate();
        let request = Self {
            trustee_public_key: identity.public_key(),
            box_public_key: secret.public_key(),
            peer_id,
        };
        (request, secret)
    }

    /// Reject requests that can never produce a usable invite.
    pub fn validate(&self) -> Result<()> {
        self.trustee_public_key
            .validate()
            .map_err(|_| IdentityError::InvalidRequest("trustee key is not a valid ed25519 point"))?;
        if self.box_public_key.as_bytes() == &[0u8; 32] {
            return Err(IdentityError::InvalidRequest("box key is the identity point"));
        }
        Ok(())
    }
}

/// What a channel member knows about the channel it invites into.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub public_key: Ed25519PublicKey,
    pub name: String,
    pub root: MessageEnvelope,
}

/// Decrypted invite contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitePayload {
    pub channel_public_key: Ed25519PublicKey,
    pub channel_name: String,
    pub root: MessageEnvelope,
    pub chain: Chain,
}

impl InvitePayload {
    pub fn channel_id(&self) -> ChannelId {
        ChannelId::derive(&self.channel_public_key)
    }

    /// Check the chain grants `trustee` posting rights at `timestamp`.
    pub fn verify_for(&self, trustee: &Ed25519PublicKey, timestamp: Timestamp) -> Result<ChannelId> {
        let channel_id = self.channel_id();
        let signer = self
            .chain
            .verify(&self.channel_public_key, &channel_id, timestamp)?;
        if self.chain.is_empty() || signer != *trustee {
            return Err(IdentityError::NotForThisIdentity);
        }
        Ok(channel_id)
    }
}

/// A sealed invite, as carried by the `Invite` wire packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    pub ephemeral_public: X25519PublicKey,
    pub nonce: EncryptionNonce,
    pub ciphertext: Vec<u8>,
}

impl Invite {
    /// Issue an invite from `inviter` answering `request`.
    ///
    /// The inviter must hold a chain for the channel (or own it). The new
    /// link is appended to that chain, which must stay within the length
    /// limit and be valid now.
    pub fn issue(
        inviter: &Identity,
        request: &InviteRequest,
        channel: ChannelInfo,
        expiration: Option<Timestamp>,
        timestamp: Timestamp,
    ) -> Result<Self> {
        request.validate()?;

        let channel_id = ChannelId::derive(&channel.public_key);
        let base = inviter
            .chain_for(&channel_id, &channel.public_key)
            .ok_or(IdentityError::NoChainFound(channel_id))?;
        let link = inviter.issue_link(request.trustee_public_key, &channel_id, expiration);
        let chain = base.extended(link)?;
        chain.verify(&channel.public_key, &channel_id, timestamp)?;

        let payload = InvitePayload {
            channel_public_key: channel.public_key,
            channel_name: channel.name,
            root: channel.root,
            chain,
        };

        tracing::debug!(
            channel = %channel_id,
            peer = %request.peer_id,
            links = payload.chain.len(),
            "issued invite"
        );
        Self::seal(&payload, &request.box_public_key)
    }

    fn seal(payload: &InvitePayload, recipient: &X25519PublicKey) -> Result<Self> {
        let mut plaintext = Vec::new();
        ciborium::into_writer(payload, &mut plaintext)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))?;

        let ephemeral = EphemeralKeyPair::generate();
        let ephemeral_public = ephemeral.public_key();
        let key = ephemeral
            .diffie_hellman(recipient)
            .derive_encryption_key(&box_context(recipient));

        let nonce = EncryptionNonce::generate();
        let ciphertext = key.encrypt(&plaintext, &nonce)?;

        Ok(Self {
            ephemeral_public,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt with the box secret from the matching request.
    pub fn open(&self, secret: &X25519StaticSecret) -> Result<InvitePayload> {
        let key = secret
            .diffie_hellman(&self.ephemeral_public)
            .derive_encryption_key(&box_context(&secret.public_key()));
        let plaintext = key.decrypt(&self.ciphertext, &self.nonce)?;
        ciborium::from_reader(&plaintext[..])
            .map_err(|e| IdentityError::SerializationError(e.to_string()))
    }

    /// Open, verify and register the invite with `identity`.
    pub fn redeem(
        &self,
        identity: &mut Identity,
        secret: &X25519StaticSecret,
        timestamp: Timestamp,
    ) -> Result<InvitePayload> {
        let payload = self.open(secret)?;
        let channel_id = payload.verify_for(&identity.public_key(), timestamp)?;
        identity.add_chain(channel_id, payload.chain.clone());
        tracing::info!(identity = %identity.name(), channel = %channel_id, "redeemed invite");
        Ok(payload)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| IdentityError::SerializationError(e.to_string()))
    }
}

fn box_context(recipient: &X25519PublicKey) -> Vec<u8> {
    let mut context = INVITE_CONTEXT.to_vec();
    context.extend_from_slice(recipient.as_bytes());
    context
}

//! Message envelopes.
//!
//! An envelope is the byte string that travels between peers and whose
//! Blake3 hash is the message's identity. Layout:
//!
//! ```text
//! [format: u8][payload...]
//!
//! format 0 (plain):             payload = canonical message
//! format 1 (chacha20-poly1305): payload = nonce (12) || ciphertext+tag
//! ```
//!
//! Channels only accept encrypted envelopes. The plain format exists so
//! decoding code paths can be exercised without a key.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::ChannelKey;
use crate::error::CoreError;
use crate::message::ChannelMessage;
use crate::types::MessageHash;

/// Domain prefix for message hashes.
const HASH_DOMAIN: &[u8] = b"weft-message-v0:";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Envelope format marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeFormat {
    Plain = 0,
    ChaCha20Poly1305 = 1,
}

impl TryFrom<u8> for EnvelopeFormat {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Plain),
            1 => Ok(Self::ChaCha20Poly1305),
            other => Err(CoreError::UnsupportedFormat(other)),
        }
    }
}

/// The wire form of a channel message.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageEnvelope(Bytes);

impl MessageEnvelope {
    /// Encrypt canonical message bytes under the channel key.
    pub fn seal(key: &ChannelKey, plaintext: &[u8]) -> Result<Self, CoreError> {
        let (nonce, ciphertext) = key.encrypt(plaintext)?;
        let mut buf = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        buf.push(EnvelopeFormat::ChaCha20Poly1305 as u8);
        buf.extend_from_slice(&nonce);
        buf.extend_from_slice(&ciphertext);
        Ok(Self(Bytes::from(buf)))
    }

    /// Wrap canonical message bytes without encryption.
    pub fn plain(plaintext: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(1 + plaintext.len());
        buf.push(EnvelopeFormat::Plain as u8);
        buf.extend_from_slice(plaintext);
        Self(Bytes::from(buf))
    }

    /// Wrap received bytes, checking the format byte and minimum length.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, CoreError> {
        let bytes = bytes.into();
        let format = bytes
            .first()
            .copied()
            .ok_or(CoreError::TruncatedEnvelope(0))?;
        if EnvelopeFormat::try_from(format)? == EnvelopeFormat::ChaCha20Poly1305
            && bytes.len() < 1 + NONCE_LEN + TAG_LEN
        {
            return Err(CoreError::TruncatedEnvelope(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn format(&self) -> Result<EnvelopeFormat, CoreError> {
        let byte = self.0.first().copied().ok_or(CoreError::TruncatedEnvelope(0))?;
        EnvelopeFormat::try_from(byte)
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.format(), Ok(EnvelopeFormat::ChaCha20Poly1305))
    }

    /// The message hash: Blake3 over the domain prefix and envelope bytes.
    pub fn hash(&self) -> MessageHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(HASH_DOMAIN);
        hasher.update(&self.0);
        MessageHash(*hasher.finalize().as_bytes())
    }

    /// Decrypt (if needed) and decode the message.
    pub fn open(&self, key: &ChannelKey) -> Result<ChannelMessage, CoreError> {
        match self.format()? {
            EnvelopeFormat::Plain => ChannelMessage::from_bytes(&self.0[1..]),
            EnvelopeFormat::ChaCha20Poly1305 => {
                if self.0.len() < 1 + NONCE_LEN + TAG_LEN {
                    return Err(CoreError::TruncatedEnvelope(self.0.len()));
                }
                let mut nonce = [0u8; NONCE_LEN];
                nonce.copy_from_slice(&self.0[1..1 + NONCE_LEN]);
                let plaintext = key.decrypt(&nonce, &self.0[1 + NONCE_LEN..])?;
                ChannelMessage::from_bytes(&plaintext)
            }
        }
    }
}

impl std::fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageEnvelope({} bytes, {})", self.0.len(), self.hash())
    }
}

impl AsRef<[u8]> for MessageEnvelope {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::crypto::Keypair;
    use crate::message::{Body, Content};
    use proptest::prelude::*;

    fn root(owner: &Keypair) -> ChannelMessage {
        let content = Content::sign(owner, Chain::empty(), 1_000.0, Body::Root, &[], 0);
        ChannelMessage::new(content, 0, vec![])
    }

    #[test]
    fn test_seal_is_deterministic() {
        let owner = Keypair::from_seed(&[0x50; 32]);
        let key = ChannelKey::derive(&owner.public_key());
        let message = root(&owner);

        let a = message.seal(&key).unwrap();
        let b = message.seal(&key).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_plain_envelope_opens_without_decryption() {
        let owner = Keypair::from_seed(&[0x50; 32]);
        let message = root(&owner);
        let envelope = MessageEnvelope::plain(&message.to_bytes());
        let unrelated = ChannelKey::derive(&Keypair::generate().public_key());

        assert!(!envelope.is_encrypted());
        assert_eq!(envelope.open(&unrelated).unwrap(), message);
    }

    #[test]
    fn test_wrong_key_fails() {
        let owner = Keypair::from_seed(&[0x50; 32]);
        let key = ChannelKey::derive(&owner.public_key());
        let other = ChannelKey::derive(&Keypair::from_seed(&[0x51; 32]).public_key());
        let envelope = root(&owner).seal(&key).unwrap();

        assert_eq!(envelope.open(&other), Err(CoreError::DecryptionFailed));
    }

    #[test]
    fn test_hash_differs_between_formats() {
        let owner = Keypair::from_seed(&[0x50; 32]);
        let key = ChannelKey::derive(&owner.public_key());
        let message = root(&owner);

        let sealed = message.seal(&key).unwrap();
        let plain = MessageEnvelope::plain(&message.to_bytes());
        assert_ne!(sealed.hash(), plain.hash());
    }

    #[test]
    fn test_from_bytes_validation() {
        assert_eq!(
            MessageEnvelope::from_bytes(Vec::new()),
            Err(CoreError::TruncatedEnvelope(0))
        );
        assert_eq!(
            MessageEnvelope::from_bytes(vec![7u8, 1, 2]),
            Err(CoreError::UnsupportedFormat(7))
        );
        assert_eq!(
            MessageEnvelope::from_bytes(vec![1u8; 20]),
            Err(CoreError::TruncatedEnvelope(20))
        );
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let owner = Keypair::from_seed(&[0x50; 32]);
        let key = ChannelKey::derive(&owner.public_key());
        let envelope = root(&owner).seal(&key).unwrap();

        let mut bytes = envelope.as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = MessageEnvelope::from_bytes(bytes).unwrap();
        assert_eq!(tampered.open(&key), Err(CoreError::DecryptionFailed));
    }

    proptest! {
        #[test]
        fn prop_text_messages_survive_sealing(text in ".{0,200}", ts in 0.0f64..4_000_000_000.0, height in 1u64..1_000_000) {
            let owner = Keypair::from_seed(&[0x52; 32]);
            let key = ChannelKey::derive(&owner.public_key());
            let parents = vec![MessageHash::from_bytes([0x01; 32])];
            let content = Content::sign(&owner, Chain::empty(), ts, Body::Text(text), &parents, height);
            let message = ChannelMessage::new(content, height, parents);

            let envelope = message.seal(&key).unwrap();
            let reparsed = MessageEnvelope::from_bytes(envelope.to_bytes()).unwrap();
            prop_assert_eq!(reparsed.hash(), envelope.hash());
            prop_assert_eq!(reparsed.open(&key).unwrap(), message);
        }
    }
}

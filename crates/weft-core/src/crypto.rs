//! Cryptographic primitives for Weft.
//!
//! Wraps Ed25519 signing, Blake3 hashing, and the channel's symmetric
//! ChaCha20-Poly1305 encryption with strong types.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;

use crate::error::CoreError;

/// Serde adapter for fixed-size byte arrays.
///
/// Serializes as a byte string; accepts byte strings or sequences on input.
pub mod byte_array {
    use serde::{de, Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ArrayVisitor<const N: usize>;

        impl<'de, const N: usize> de::Visitor<'de> for ArrayVisitor<N> {
            type Value = [u8; N];

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} bytes", N)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                v.try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                self.visit_bytes(&v)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut out = [0u8; N];
                for (i, byte) in out.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(out)
            }
        }

        deserializer.deserialize_bytes(ArrayVisitor::<N>)
    }
}

/// Compare two byte strings without leaking where they differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// A 32-byte Blake3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blake3Hash(#[serde(with = "byte_array")] pub [u8; 32]);

impl Blake3Hash {
    /// Compute the Blake3 hash of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3({})", &self.to_hex()[..16])
    }
}

/// A 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ed25519PublicKey(#[serde(with = "byte_array")] pub [u8; 32]);

impl Ed25519PublicKey {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice of arbitrary length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CoreError::InvalidPublicKey)?;
        let key = Self(arr);
        key.validate()?;
        Ok(key)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Check that the bytes decode to a curve point.
    pub fn validate(&self) -> Result<(), CoreError> {
        VerifyingKey::from_bytes(&self.0)
            .map(|_| ())
            .map_err(|_| CoreError::InvalidPublicKey)
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), CoreError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = Signature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Pub({})", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Ed25519PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ed25519Signature(#[serde(with = "byte_array")] pub [u8; 64]);

impl Ed25519Signature {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Sig({}...)", &self.to_hex()[..16])
    }
}

/// A signing keypair.
///
/// This wraps ed25519-dalek's SigningKey.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Ed25519Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Get the raw seed bytes (secret key material).
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({:?})", self.public_key())
    }
}

/// Symmetric key that encrypts every message of one channel.
///
/// Derived from the channel public key, so holding the key (shared through
/// invites) is what grants read access.
#[derive(Clone)]
pub struct ChannelKey([u8; 32]);

impl ChannelKey {
    const CONTEXT: &'static str = "weft 2026-01 channel message key";

    /// Derive the key for a channel.
    pub fn derive(channel_public_key: &Ed25519PublicKey) -> Self {
        Self(blake3::derive_key(Self::CONTEXT, channel_public_key.as_bytes()))
    }

    /// Nonce bound to the plaintext.
    ///
    /// Deterministic: the same message under the same key always encrypts to
    /// the same bytes, which keeps envelope hashes stable.
    pub fn nonce_for(&self, plaintext: &[u8]) -> [u8; 12] {
        let digest = blake3::keyed_hash(&self.0, plaintext);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&digest.as_bytes()[..12]);
        nonce
    }

    /// Encrypt, returning the nonce and ciphertext (with tag).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<([u8; 12], Vec<u8>), CoreError> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CoreError::EncryptionFailed)?;
        let nonce = self.nonce_for(plaintext);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CoreError::EncryptionFailed)?;
        Ok((nonce, ciphertext))
    }

    /// Decrypt and check the nonce was derived from the recovered plaintext.
    pub fn decrypt(&self, nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>, CoreError> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CoreError::DecryptionFailed)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CoreError::DecryptionFailed)?;

        if !constant_time_eq(&self.nonce_for(&plaintext), nonce) {
            return Err(CoreError::NonceMismatch);
        }
        Ok(plaintext)
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_sign_verify() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"hello world");

        keypair
            .public_key()
            .verify(b"hello world", &signature)
            .expect("valid signature should verify");
        assert!(keypair.public_key().verify(b"hello worlD", &signature).is_err());
    }

    #[test]
    fn test_keypair_deterministic_from_seed() {
        let kp1 = Keypair::from_seed(&[0x42; 32]);
        let kp2 = Keypair::from_seed(&[0x42; 32]);
        assert_eq!(kp1.public_key(), kp2.public_key());
        assert_eq!(kp1.seed(), [0x42; 32]);
    }

    #[test]
    fn test_public_key_from_slice_rejects_bad_length() {
        assert_eq!(
            Ed25519PublicKey::from_slice(&[1u8; 31]),
            Err(CoreError::InvalidPublicKey)
        );
        let pk = Keypair::generate().public_key();
        assert_eq!(Ed25519PublicKey::from_slice(pk.as_bytes()), Ok(pk));
    }

    #[test]
    fn test_channel_key_roundtrip() {
        let owner = Keypair::from_seed(&[0x11; 32]);
        let key = ChannelKey::derive(&owner.public_key());

        let (nonce, ciphertext) = key.encrypt(b"secret").unwrap();
        assert_ne!(&ciphertext[..], b"secret");
        assert_eq!(key.decrypt(&nonce, &ciphertext).unwrap(), b"secret");
    }

    #[test]
    fn test_channel_key_is_deterministic() {
        let owner = Keypair::from_seed(&[0x11; 32]);
        let key = ChannelKey::derive(&owner.public_key());

        let a = key.encrypt(b"same plaintext").unwrap();
        let b = key.encrypt(b"same plaintext").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_channel_key_wrong_key_fails() {
        let key1 = ChannelKey::derive(&Keypair::from_seed(&[0x01; 32]).public_key());
        let key2 = ChannelKey::derive(&Keypair::from_seed(&[0x02; 32]).public_key());

        let (nonce, ciphertext) = key1.encrypt(b"secret").unwrap();
        assert_eq!(
            key2.decrypt(&nonce, &ciphertext),
            Err(CoreError::DecryptionFailed)
        );
    }

    #[test]
    fn test_channel_key_rejects_foreign_nonce() {
        let key = ChannelKey::derive(&Keypair::from_seed(&[0x01; 32]).public_key());
        let cipher = ChaCha20Poly1305::new_from_slice(&key.0).unwrap();

        // Valid AEAD output under a nonce not derived from the plaintext.
        let nonce = [0x55u8; 12];
        let ciphertext = cipher.encrypt(Nonce::from_slice(&nonce), &b"secret"[..]).unwrap();
        assert_eq!(key.decrypt(&nonce, &ciphertext), Err(CoreError::NonceMismatch));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}

//! Golden test vectors for deterministic verification.
//!
//! Signing and sealing are deterministic, so a seed and a timestamp fix a
//! message's envelope bytes and hash. These vectors pin that down across
//! releases and implementations.

use serde::Serialize;

use weft_channel::Channel;
use weft_core::{Body, ChannelId, MessageEnvelope, MessageHash, Timestamp};

use crate::fixtures::identity_from_seed;

/// A golden test vector.
#[derive(Debug, Clone)]
pub struct GoldenVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    /// Seed byte repeated into the owner's 32-byte key seed.
    pub seed: u8,
    pub channel_name: &'static str,
    /// Root timestamp.
    pub timestamp: Timestamp,
    /// Text posted one second after the root, if any.
    pub post: Option<&'static str>,
    /// Expected hash of the last message (hex). Empty means not pinned yet.
    pub expected_hash: &'static str,
}

/// Everything derived from a vector.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedVector {
    pub name: String,
    pub channel_id: String,
    pub root_hash: String,
    /// Hash of the last message: the post if there is one, else the root.
    #[serde(skip)]
    pub hash: MessageHash,
    pub envelope_hex: String,
}

/// Get all golden test vectors.
pub fn all_vectors() -> Vec<GoldenVector> {
    vec![
        GoldenVector {
            name: "root only",
            seed: 0x42,
            channel_name: "general",
            timestamp: 1_700_000_000.0,
            post: None,
            expected_hash: "",
        },
        GoldenVector {
            name: "hello after root",
            seed: 0x42,
            channel_name: "general",
            timestamp: 1_700_000_000.0,
            post: Some("hello"),
            expected_hash: "",
        },
        GoldenVector {
            name: "fractional timestamp",
            seed: 0x07,
            channel_name: "",
            timestamp: 1_700_000_000.25,
            post: Some(""),
            expected_hash: "",
        },
    ]
}

/// Build the channel a vector describes and return its last envelope.
pub fn generate_from_vector(vector: &GoldenVector) -> GeneratedVector {
    let owner = identity_from_seed("vector", vector.seed);
    let mut channel = Channel::create_at(&owner, vector.channel_name, vector.timestamp)
        .expect("vector root is valid");
    let root_hash = channel.root_hash();

    let envelope: MessageEnvelope = match vector.post {
        Some(text) => channel
            .post_at(Body::Text(text.into()), &owner, vector.timestamp + 1.0)
            .expect("vector post is valid"),
        None => channel.root().envelope.clone(),
    };

    GeneratedVector {
        name: vector.name.to_string(),
        channel_id: channel_id_hex(channel.channel_id()),
        root_hash: root_hash.to_hex(),
        hash: envelope.hash(),
        envelope_hex: hex::encode(envelope.as_bytes()),
    }
}

fn channel_id_hex(channel_id: &ChannelId) -> String {
    hex::encode(channel_id.as_bytes())
}

/// Check every vector, returning `(name, matches, actual hash)`.
///
/// Vectors without an expected hash always match.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    all_vectors()
        .iter()
        .map(|v| {
            let hex = generate_from_vector(v).hash.to_hex();
            let matches = v.expected_hash.is_empty() || hex == v.expected_hash;
            (v.name.to_string(), matches, hex)
        })
        .collect()
}

/// All generated vectors as pretty JSON, for other implementations.
pub fn vectors_json() -> serde_json::Result<String> {
    let generated: Vec<GeneratedVector> = all_vectors().iter().map(generate_from_vector).collect();
    serde_json::to_string_pretty(&generated)
}

//! Canonical CBOR encoding for deterministic serialization.
//!
//! This module implements RFC 8949 Core Deterministic Encoding, restricted
//! to what channel messages need:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - Floats are always 8-byte IEEE 754 (timestamps and expirations)
//!
//! Message hashes are taken over encrypted envelopes whose plaintext is
//! this encoding, so two peers holding the same message must produce
//! identical bytes. Decoding re-encodes and rejects anything that differs.

use ciborium::value::{Integer, Value};

use crate::chain::{Chain, Link};
use crate::crypto::{Ed25519PublicKey, Ed25519Signature};
use crate::error::CoreError;
use crate::message::{Body, ChannelMessage, Content};
use crate::types::{ChannelId, MessageHash, Timestamp};

/// Domain prefix for link signatures.
pub const LINK_DOMAIN: &[u8] = b"weft-link-v0:";

/// Domain prefix for content signatures.
pub const CONTENT_DOMAIN: &[u8] = b"weft-content-v0:";

/// Integer map keys. Keys 0-23 encode as single bytes in CBOR.
mod keys {
    pub mod link {
        pub const TRUSTEE: u64 = 0;
        pub const EXPIRATION: u64 = 1;
        pub const SIGNATURE: u64 = 2;
        /// Only present in the to-be-signed form.
        pub const CHANNEL_ID: u64 = 2;
    }

    pub mod content {
        pub const CHAIN: u64 = 0;
        pub const TIMESTAMP: u64 = 1;
        pub const BODY: u64 = 2;
        pub const SIGNATURE: u64 = 3;
        /// To-be-signed form only.
        pub const PARENTS: u64 = 3;
        pub const HEIGHT: u64 = 4;
    }

    pub mod message {
        pub const CONTENT: u64 = 0;
        pub const HEIGHT: u64 = 1;
        pub const PARENTS: u64 = 2;
    }

    pub mod body {
        pub const ROOT: u64 = 0;
        pub const TEXT: u64 = 1;
    }
}

fn key(k: u64) -> Value {
    Value::Integer(k.into())
}

fn link_to_value(link: &Link) -> Value {
    Value::Map(vec![
        (key(keys::link::TRUSTEE), Value::Bytes(link.trustee.0.to_vec())),
        (key(keys::link::EXPIRATION), Value::Float(link.expiration)),
        (key(keys::link::SIGNATURE), Value::Bytes(link.signature.0.to_vec())),
    ])
}

fn chain_to_value(chain: &Chain) -> Value {
    Value::Array(chain.links().iter().map(link_to_value).collect())
}

fn body_to_value(body: &Body) -> Value {
    match body {
        Body::Root => Value::Array(vec![key(keys::body::ROOT)]),
        Body::Text(text) => Value::Array(vec![key(keys::body::TEXT), Value::Text(text.clone())]),
    }
}

fn parents_to_value(parents: &[MessageHash]) -> Value {
    Value::Array(parents.iter().map(|p| Value::Bytes(p.0.to_vec())).collect())
}

fn content_to_value(content: &Content) -> Value {
    Value::Map(vec![
        (key(keys::content::CHAIN), chain_to_value(&content.chain)),
        (key(keys::content::TIMESTAMP), Value::Float(content.timestamp)),
        (key(keys::content::BODY), body_to_value(&content.body)),
        (key(keys::content::SIGNATURE), Value::Bytes(content.signature.0.to_vec())),
    ])
}

fn message_to_value(message: &ChannelMessage) -> Value {
    Value::Map(vec![
        (key(keys::message::CONTENT), content_to_value(&message.content)),
        (key(keys::message::HEIGHT), Value::Integer(message.height.into())),
        (key(keys::message::PARENTS), parents_to_value(&message.parents)),
    ])
}

/// Bytes a link issuer signs.
///
/// The channel id is bound here and nowhere else: the stored link omits it,
/// so a link only verifies in the context of the channel it was issued for.
pub fn link_signing_bytes(
    trustee: &Ed25519PublicKey,
    expiration: Timestamp,
    channel_id: &ChannelId,
) -> Vec<u8> {
    let value = Value::Map(vec![
        (key(keys::link::TRUSTEE), Value::Bytes(trustee.0.to_vec())),
        (key(keys::link::EXPIRATION), Value::Float(expiration)),
        (key(keys::link::CHANNEL_ID), Value::Bytes(channel_id.0.to_vec())),
    ]);
    let mut buf = LINK_DOMAIN.to_vec();
    encode_value_to(&mut buf, &value);
    buf
}

/// Bytes a content author signs: the whole chain plus everything that
/// positions the message in the DAG.
pub fn content_signing_bytes(
    chain: &Chain,
    timestamp: Timestamp,
    body: &Body,
    parents: &[MessageHash],
    height: u64,
) -> Vec<u8> {
    let value = Value::Map(vec![
        (key(keys::content::CHAIN), chain_to_value(chain)),
        (key(keys::content::TIMESTAMP), Value::Float(timestamp)),
        (key(keys::content::BODY), body_to_value(body)),
        (key(keys::content::PARENTS), parents_to_value(parents)),
        (key(keys::content::HEIGHT), Value::Integer(height.into())),
    ]);
    let mut buf = CONTENT_DOMAIN.to_vec();
    encode_value_to(&mut buf, &value);
    buf
}

/// Encode a message to canonical bytes (the envelope plaintext).
pub fn message_bytes(message: &ChannelMessage) -> Vec<u8> {
    encode_cbor_value_canonical(&message_to_value(message))
}

/// Encode a CBOR Value to canonical bytes.
pub fn encode_cbor_value_canonical(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value);
    buf
}

fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => {
            encode_uint(buf, 2, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::Text(s) => {
            encode_uint(buf, 3, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(arr) => {
            encode_uint(buf, 4, arr.len() as u64);
            for item in arr {
                encode_value_to(buf, item);
            }
        }
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Float(f) => {
            buf.push(0xfb);
            buf.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        _ => panic!("unsupported CBOR value type in canonical encoding"),
    }
}

fn encode_integer(buf: &mut Vec<u8>, i: Integer) {
    let n: i128 = i.into();
    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        encode_uint(buf, 1, (-1 - n) as u64);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Keys are sorted by their encoded bytes.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| {
            let mut key_buf = Vec::new();
            encode_value_to(&mut key_buf, k);
            (key_buf, v)
        })
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}

/// Decode a message from canonical bytes.
///
/// Fails with [`CoreError::NonCanonical`] if the input decodes but is not
/// byte-identical to the canonical encoding of the result.
pub fn decode_message(bytes: &[u8]) -> Result<ChannelMessage, CoreError> {
    let value: Value =
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))?;
    let message = value_to_message(&value)?;

    if message_bytes(&message) != bytes {
        return Err(CoreError::NonCanonical);
    }
    Ok(message)
}

fn malformed(what: &str) -> CoreError {
    CoreError::MalformedMessage(what.to_string())
}

fn as_map<'a>(value: &'a Value, what: &str) -> Result<&'a [(Value, Value)], CoreError> {
    match value {
        Value::Map(entries) => Ok(entries),
        _ => Err(malformed(what)),
    }
}

fn field<'a>(map: &'a [(Value, Value)], k: u64) -> Option<&'a Value> {
    map.iter()
        .find(|(candidate, _)| {
            matches!(candidate, Value::Integer(i) if i128::from(*i) == i128::from(k))
        })
        .map(|(_, v)| v)
}

fn fixed_bytes<const N: usize>(value: Option<&Value>, what: &str) -> Result<[u8; N], CoreError> {
    match value {
        Some(Value::Bytes(b)) => b.as_slice().try_into().map_err(|_| malformed(what)),
        _ => Err(malformed(what)),
    }
}

fn float(value: Option<&Value>, what: &str) -> Result<f64, CoreError> {
    match value {
        Some(Value::Float(f)) => Ok(*f),
        _ => Err(malformed(what)),
    }
}

fn uint(value: Option<&Value>, what: &str) -> Result<u64, CoreError> {
    match value {
        Some(Value::Integer(i)) => u64::try_from(*i).map_err(|_| malformed(what)),
        _ => Err(malformed(what)),
    }
}

fn value_to_link(value: &Value) -> Result<Link, CoreError> {
    let map = as_map(value, "link")?;
    Ok(Link {
        trustee: Ed25519PublicKey(fixed_bytes(field(map, keys::link::TRUSTEE), "link trustee")?),
        expiration: float(field(map, keys::link::EXPIRATION), "link expiration")?,
        signature: Ed25519Signature(fixed_bytes(
            field(map, keys::link::SIGNATURE),
            "link signature",
        )?),
    })
}

fn value_to_body(value: Option<&Value>) -> Result<Body, CoreError> {
    let items = match value {
        Some(Value::Array(items)) => items,
        _ => return Err(malformed("body")),
    };
    match (uint(items.first(), "body kind")?, items.get(1)) {
        (keys::body::ROOT, None) => Ok(Body::Root),
        (keys::body::TEXT, Some(Value::Text(text))) if items.len() == 2 => {
            Ok(Body::Text(text.clone()))
        }
        _ => Err(malformed("body")),
    }
}

fn value_to_content(value: Option<&Value>) -> Result<Content, CoreError> {
    let map = as_map(value.ok_or_else(|| malformed("content"))?, "content")?;

    let links = match field(map, keys::content::CHAIN) {
        Some(Value::Array(items)) => items
            .iter()
            .map(value_to_link)
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(malformed("chain")),
    };

    Ok(Content {
        chain: Chain::from_links(links),
        timestamp: float(field(map, keys::content::TIMESTAMP), "timestamp")?,
        body: value_to_body(field(map, keys::content::BODY))?,
        signature: Ed25519Signature(fixed_bytes(
            field(map, keys::content::SIGNATURE),
            "content signature",
        )?),
    })
}

fn value_to_message(value: &Value) -> Result<ChannelMessage, CoreError> {
    let map = as_map(value, "message")?;

    let parents = match field(map, keys::message::PARENTS) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| fixed_bytes(Some(item), "parent").map(MessageHash))
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(malformed("parents")),
    };

    Ok(ChannelMessage {
        content: value_to_content(field(map, keys::message::CONTENT))?,
        height: uint(field(map, keys::message::HEIGHT), "height")?,
        parents,
    })
}

//! Proptest generators for property-based testing.

use proptest::prelude::*;

use weft_channel::{BulkRequest, Cursor, QueryRequest, SYNC_LIMIT};
use weft_core::{
    Blake3Hash, Body, Chain, ChannelId, ChannelKey, ChannelMessage, Content, Ed25519PublicKey,
    Keypair, MessageEnvelope, MessageHash, PeerId, Timestamp,
};
use weft_sync::Packet;

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

pub fn message_hash() -> impl Strategy<Value = MessageHash> {
    any::<[u8; 32]>().prop_map(MessageHash::from_bytes)
}

pub fn channel_id() -> impl Strategy<Value = ChannelId> {
    any::<[u8; 32]>().prop_map(ChannelId::from_bytes)
}

pub fn peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 32]>().prop_map(PeerId::from_bytes)
}

pub fn blake3_hash() -> impl Strategy<Value = Blake3Hash> {
    any::<[u8; 32]>().prop_map(Blake3Hash)
}

pub fn public_key() -> impl Strategy<Value = Ed25519PublicKey> {
    keypair().prop_map(|kp| kp.public_key())
}

/// Whole and fractional seconds between 2001 and 2033.
pub fn timestamp() -> impl Strategy<Value = Timestamp> {
    (1_000_000_000u32..2_000_000_000u32, 0u32..1000u32)
        .prop_map(|(secs, millis)| secs as f64 + millis as f64 / 1000.0)
}

pub fn text() -> impl Strategy<Value = String> {
    "\\PC{0,64}".prop_map(String::from)
}

pub fn body() -> impl Strategy<Value = Body> {
    prop_oneof![Just(Body::Root), text().prop_map(Body::Text)]
}

pub fn cursor() -> impl Strategy<Value = Cursor> {
    prop_oneof![
        any::<u64>().prop_map(Cursor::Height),
        message_hash().prop_map(Cursor::Hash),
    ]
}

pub fn query_request() -> impl Strategy<Value = QueryRequest> {
    (cursor(), any::<bool>(), 1u32..=SYNC_LIMIT as u32).prop_map(|(cursor, is_backward, limit)| {
        let request = if is_backward {
            QueryRequest::backward(cursor)
        } else {
            QueryRequest::forward(cursor)
        };
        request.with_limit(limit)
    })
}

pub fn bulk_request() -> impl Strategy<Value = BulkRequest> {
    prop::collection::vec(message_hash(), 0..=SYNC_LIMIT).prop_map(|hashes| BulkRequest { hashes })
}

/// Request packets a peer may send.
pub fn request_packet() -> impl Strategy<Value = Packet> {
    prop_oneof![
        channel_id().prop_map(|channel_id| Packet::Notification { channel_id }),
        (any::<u64>(), channel_id(), query_request()).prop_map(|(request_id, channel_id, request)| {
            Packet::Query {
                request_id,
                channel_id,
                request,
            }
        }),
        (any::<u64>(), channel_id(), bulk_request()).prop_map(|(request_id, channel_id, request)| {
            Packet::Bulk {
                request_id,
                channel_id,
                request,
            }
        }),
    ]
}

/// Parameters for a single message signed directly by a channel key.
#[derive(Debug, Clone)]
pub struct MessageParams {
    pub keypair: Keypair,
    pub timestamp: Timestamp,
    pub body: Body,
    pub height: u64,
    pub parents: Vec<MessageHash>,
}

impl Arbitrary for MessageParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            any::<[u8; 32]>(),
            timestamp(),
            body(),
            0u64..=10_000u64,
            prop::collection::vec(message_hash(), 0..4),
        )
            .prop_map(|(seed, timestamp, body, height, parents)| MessageParams {
                keypair: Keypair::from_seed(&seed),
                timestamp,
                body,
                height,
                parents,
            })
            .boxed()
    }
}

pub fn message_from_params(params: &MessageParams) -> ChannelMessage {
    let content = Content::sign(
        &params.keypair,
        Chain::empty(),
        params.timestamp,
        params.body.clone(),
        &params.parents,
        params.height,
    );
    ChannelMessage::new(content, params.height, params.parents.clone())
}

/// Seal the message under the key of the channel its keypair owns.
pub fn envelope_from_params(params: &MessageParams) -> MessageEnvelope {
    let key = ChannelKey::derive(&params.keypair.public_key());
    message_from_params(params)
        .seal(&key)
        .expect("sealing a well-formed message succeeds")
}

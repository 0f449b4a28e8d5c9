//! Proptest generators for property-based testing.

use proptest::prelude::*;

use courier_core::{Envelope, EnvelopeHash, MessageId, PeerId, Topic};

/// Generate a random Topic.
pub fn topic() -> impl Strategy<Value = Topic> {
    any::<[u8; 4]>().prop_map(Topic::from_bytes)
}

/// Generate one of a few topics, so filters see both hits and misses.
pub fn small_topic() -> impl Strategy<Value = Topic> {
    prop_oneof![
        Just(Topic::from_u32(0xAABBCCDD)),
        Just(Topic::from_u32(0x01020304)),
        Just(Topic::from_u32(0x12345678)),
    ]
}

pub fn envelope_hash() -> impl Strategy<Value = EnvelopeHash> {
    any::<[u8; 32]>().prop_map(EnvelopeHash::from_bytes)
}

pub fn peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 32]>().prop_map(PeerId::from_bytes)
}

pub fn message_id() -> impl Strategy<Value = MessageId> {
    any::<[u8; 32]>().prop_map(MessageId::from_bytes)
}

/// Generate a unix timestamp in seconds, leaving headroom for `to + 1`.
pub fn timestamp() -> impl Strategy<Value = u32> {
    1u32..u32::MAX / 2
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Parameters for generating an envelope.
#[derive(Debug, Clone)]
pub struct EnvelopeParams {
    pub timestamp: u32,
    pub ttl: u32,
    pub topic: Topic,
    pub nonce: u64,
    pub payload: Vec<u8>,
}

impl Arbitrary for EnvelopeParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (timestamp(), 1u32..3600, topic(), any::<u64>(), payload(256))
            .prop_map(|(timestamp, ttl, topic, nonce, payload)| EnvelopeParams {
                timestamp,
                ttl,
                topic,
                nonce,
                payload,
            })
            .boxed()
    }
}

/// Build an envelope from parameters.
pub fn envelope_from_params(params: &EnvelopeParams) -> Envelope {
    Envelope::new(params.timestamp, params.ttl, params.topic, params.payload.clone())
        .with_nonce(params.nonce)
}

/// A small archive: `(timestamp, topic)` pairs inside `[1, span]`.
///
/// Each entry gets a distinct nonce when materialized, so duplicates in
/// this list still produce distinct envelopes.
pub fn timeline(max_len: usize, span: u32) -> impl Strategy<Value = Vec<(u32, Topic)>> {
    prop::collection::vec((1u32..=span, small_topic()), 0..=max_len)
}

/// Turn a timeline into envelopes.
pub fn materialize(timeline: &[(u32, Topic)]) -> Vec<Envelope> {
    timeline
        .iter()
        .enumerate()
        .map(|(i, (ts, topic))| Envelope::new(*ts, 60, *topic, vec![0u8; 8]).with_nonce(i as u64))
        .collect()
}

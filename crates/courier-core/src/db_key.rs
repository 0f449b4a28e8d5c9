//! Time-ordered storage keys.
//!
//! Layout (72 bytes):
//!
//! ```text
//! timestamp (u64, big-endian) | SHA-256(topic) (32) | envelope hash (32)
//! ```
//!
//! Byte-wise comparison of two keys orders them by timestamp first, so a
//! time range is one contiguous scan over an ordered store.

use std::fmt;

use crate::crypto::topic_hash;
use crate::envelope::Envelope;
use crate::error::{CoreError, Result};
use crate::types::{EnvelopeHash, Topic};

/// Length of an encoded [`DbKey`].
pub const DB_KEY_LENGTH: usize = 72;

const TIMESTAMP_LENGTH: usize = 8;
const TOPIC_HASH_OFFSET: usize = TIMESTAMP_LENGTH;
const DIGEST_OFFSET: usize = TOPIC_HASH_OFFSET + 32;

/// A persisted envelope key.
///
/// Field order matches the byte layout, so the derived `Ord` agrees with
/// byte-wise comparison of [`DbKey::to_bytes`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DbKey {
    timestamp: u64,
    topic_hash: [u8; 32],
    digest: [u8; 32],
}

impl DbKey {
    pub fn new(timestamp: u64, topic: &Topic, hash: &EnvelopeHash) -> Self {
        Self {
            timestamp,
            topic_hash: topic_hash(topic).0,
            digest: hash.0,
        }
    }

    /// Key under which an envelope is archived.
    pub fn for_envelope(envelope: &Envelope) -> Self {
        Self::new(u64::from(envelope.timestamp()), &envelope.topic, &envelope.hash())
    }

    /// The smallest key with the given timestamp. Used as a range bound.
    pub const fn boundary(timestamp: u64) -> Self {
        Self {
            timestamp,
            topic_hash: [0u8; 32],
            digest: [0u8; 32],
        }
    }

    pub const fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub const fn topic_hash(&self) -> &[u8; 32] {
        &self.topic_hash
    }

    pub fn envelope_hash(&self) -> EnvelopeHash {
        EnvelopeHash(self.digest)
    }

    pub fn to_bytes(&self) -> [u8; DB_KEY_LENGTH] {
        let mut out = [0u8; DB_KEY_LENGTH];
        out[..TOPIC_HASH_OFFSET].copy_from_slice(&self.timestamp.to_be_bytes());
        out[TOPIC_HASH_OFFSET..DIGEST_OFFSET].copy_from_slice(&self.topic_hash);
        out[DIGEST_OFFSET..].copy_from_slice(&self.digest);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != DB_KEY_LENGTH {
            return Err(CoreError::InvalidKeyLength {
                expected: DB_KEY_LENGTH,
                got: bytes.len(),
            });
        }

        let mut ts = [0u8; TIMESTAMP_LENGTH];
        ts.copy_from_slice(&bytes[..TOPIC_HASH_OFFSET]);
        let mut topic_hash = [0u8; 32];
        topic_hash.copy_from_slice(&bytes[TOPIC_HASH_OFFSET..DIGEST_OFFSET]);
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[DIGEST_OFFSET..]);

        Ok(Self {
            timestamp: u64::from_be_bytes(ts),
            topic_hash,
            digest,
        })
    }

    /// Whether this key's topic field belongs to `topic`.
    pub fn has_topic(&self, topic: &Topic) -> bool {
        self.topic_hash == topic_hash(topic).0
    }

    /// The smallest byte string strictly greater than `cursor`.
    pub fn cursor_successor(cursor: &[u8]) -> Vec<u8> {
        let mut next = Vec::with_capacity(cursor.len() + 1);
        next.extend_from_slice(cursor);
        next.push(0x00);
        next
    }
}

/// Topic-hash bytes of an encoded key, without decoding the rest.
pub fn key_topic_hash(key: &[u8]) -> Option<&[u8]> {
    key.get(TOPIC_HASH_OFFSET..DIGEST_OFFSET)
}

impl fmt::Debug for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DbKey({}, {}.., {}..)",
            self.timestamp,
            hex::encode(&self.topic_hash[..4]),
            hex::encode(&self.digest[..8])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_layout() {
        let topic = Topic::from_u32(0xAABBCCDD);
        let hash = EnvelopeHash::from_bytes([0x11; 32]);
        let bytes = DbKey::new(0x0102030405060708, &topic, &hash).to_bytes();

        assert_eq!(&bytes[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[8..40], topic_hash(&topic).as_bytes());
        assert_eq!(&bytes[40..], &[0x11; 32]);
    }

    #[test]
    fn test_from_bytes_roundtrip_fields() {
        let topic = Topic::from_u32(5);
        let hash = EnvelopeHash::from_bytes([0x22; 32]);
        let key = DbKey::new(42, &topic, &hash);
        let parsed = DbKey::from_bytes(&key.to_bytes()).unwrap();

        assert_eq!(parsed, key);
        assert_eq!(parsed.timestamp(), 42);
        assert_eq!(parsed.envelope_hash(), hash);
        assert!(parsed.has_topic(&topic));
        assert!(!parsed.has_topic(&Topic::from_u32(6)));
    }

    #[test]
    fn test_from_bytes_wrong_length() {
        assert!(matches!(
            DbKey::from_bytes(&[0u8; 71]),
            Err(CoreError::InvalidKeyLength { expected: 72, got: 71 })
        ));
        assert!(DbKey::from_bytes(&[0u8; 73]).is_err());
    }

    #[test]
    fn test_boundary_sorts_before_same_second() {
        let key = DbKey::new(100, &Topic::from_u32(1), &EnvelopeHash::ZERO);
        assert!(DbKey::boundary(100).to_bytes() <= key.to_bytes());
        assert!(key.to_bytes() < DbKey::boundary(101).to_bytes());
    }

    #[test]
    fn test_cursor_successor_is_next_byte_string() {
        let key = DbKey::new(100, &Topic::from_u32(1), &EnvelopeHash::from_bytes([0xFF; 32]));
        let cursor = key.to_bytes();
        let next = DbKey::cursor_successor(&cursor);

        assert!(next.as_slice() > &cursor[..]);
        assert_eq!(next.len(), DB_KEY_LENGTH + 1);
        assert!(next.as_slice() < &DbKey::boundary(101).to_bytes()[..]);
    }

    #[test]
    fn test_key_topic_hash() {
        let topic = Topic::from_u32(9);
        let bytes = DbKey::new(1, &topic, &EnvelopeHash::ZERO).to_bytes();
        assert_eq!(key_topic_hash(&bytes), Some(&topic_hash(&topic).0[..]));
        assert_eq!(key_topic_hash(&[0u8; 10]), None);
    }

    proptest! {
        #[test]
        fn keys_sort_by_time_first(
            t1 in any::<u64>(),
            t2 in any::<u64>(),
            topic1 in any::<[u8; 4]>(),
            topic2 in any::<[u8; 4]>(),
            d1 in any::<[u8; 32]>(),
            d2 in any::<[u8; 32]>(),
        ) {
            prop_assume!(t1 < t2);
            let k1 = DbKey::new(t1, &Topic(topic1), &EnvelopeHash(d1));
            let k2 = DbKey::new(t2, &Topic(topic2), &EnvelopeHash(d2));
            prop_assert!(k1.to_bytes() < k2.to_bytes());
            prop_assert!(k1 < k2);
        }

        #[test]
        fn derived_order_matches_bytes(
            t1 in 0u64..4,
            t2 in 0u64..4,
            d1 in any::<[u8; 32]>(),
            d2 in any::<[u8; 32]>(),
        ) {
            let topic = Topic::from_u32(1);
            let k1 = DbKey::new(t1, &topic, &EnvelopeHash(d1));
            let k2 = DbKey::new(t2, &topic, &EnvelopeHash(d2));
            prop_assert_eq!(k1.cmp(&k2), k1.to_bytes().cmp(&k2.to_bytes()));
        }
    }
}

//! Golden vectors for the persisted layouts.
//!
//! Bloom samples and storage keys are shared with other implementations
//! and with data already on disk, so their bytes must never change.

use courier_core::{topic_to_bloom, DbKey, EnvelopeHash, Topic};

/// Expected bloom sample for a topic.
#[derive(Debug, Clone)]
pub struct BloomVector {
    pub name: &'static str,
    pub topic: u32,
    /// 64 bytes, hex.
    pub expected_bloom: &'static str,
}

/// Expected storage key for a `(timestamp, topic, digest)` triple.
#[derive(Debug, Clone)]
pub struct KeyVector {
    pub name: &'static str,
    pub timestamp: u64,
    pub topic: u32,
    pub digest: [u8; 32],
    /// 72 bytes, hex.
    pub expected_key: &'static str,
}

pub fn bloom_vectors() -> Vec<BloomVector> {
    vec![
        BloomVector {
            name: "scenario topic",
            topic: 0xAABBCCDD,
            expected_bloom: "00000000000000000000000000000000000000000000000800000000000000000000000000000000000000000000000000000000000400000010000000000000",
        },
        BloomVector {
            name: "zero topic sets bit 0 only",
            topic: 0x00000000,
            expected_bloom: "01000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000",
        },
        BloomVector {
            name: "fourth byte offsets the third index",
            topic: 0x01020304,
            expected_bloom: "06000000000000000000000000000000000000000000000000000000000000000800000000000000000000000000000000000000000000000000000000000000",
        },
        BloomVector {
            name: "all ones collapse to one bit",
            topic: 0xFFFFFFFF,
            expected_bloom: "00000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000080",
        },
        BloomVector {
            name: "no offsets",
            topic: 0x12345678,
            expected_bloom: "00000400000010000000400000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000",
        },
    ]
}

pub fn key_vectors() -> Vec<KeyVector> {
    vec![
        KeyVector {
            name: "scenario topic at 2025-01-14",
            timestamp: 1_736_870_400,
            topic: 0xAABBCCDD,
            digest: [0x11; 32],
            expected_key: concat!(
                "0000000067868a00",
                "8d70d691c822d55638b6e7fd54cd94170c87d19eb1f628b757506ede5688d297",
                "1111111111111111111111111111111111111111111111111111111111111111",
            ),
        },
        KeyVector {
            name: "zero timestamp and zero topic",
            timestamp: 0,
            topic: 0,
            digest: [0x00; 32],
            expected_key: concat!(
                "0000000000000000",
                "df3f619804a92fdb4057192dc43dd748ea778adc52bc498ce80524c014b81119",
                "0000000000000000000000000000000000000000000000000000000000000000",
            ),
        },
    ]
}

/// Check every vector, returning the names of those that fail.
pub fn verify_all_vectors() -> Vec<&'static str> {
    let mut failures = Vec::new();
    for v in bloom_vectors() {
        if hex::encode(topic_to_bloom(&Topic::from_u32(v.topic))) != v.expected_bloom {
            failures.push(v.name);
        }
    }
    for v in key_vectors() {
        let key = DbKey::new(v.timestamp, &Topic::from_u32(v.topic), &EnvelopeHash::from_bytes(v.digest));
        if hex::encode(key.to_bytes()) != v.expected_key {
            failures.push(v.name);
        }
    }
    failures
}

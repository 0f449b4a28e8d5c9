//! Bloom index over topics.
//!
//! A topic maps to three bit positions inside a 512-bit (64-byte) field.
//! Filters are unions of topic blooms; matching is a subset test, so a
//! filter can accept several topics at once. False positives are possible,
//! false negatives are not.

use crate::error::{CoreError, Result};
use crate::types::Topic;

/// Size of a bloom filter in bytes.
pub const BLOOM_FILTER_SIZE: usize = 64;

/// A 64-byte topic bloom filter.
pub type Bloom = [u8; BLOOM_FILTER_SIZE];

/// Derive the bloom sample of a topic.
///
/// Each of the first three topic bytes selects a bit in the low 256 bits;
/// bit `j` of the fourth byte moves the `j`-th index into the high 256 bits.
pub fn topic_to_bloom(topic: &Topic) -> Bloom {
    let bytes = topic.as_bytes();
    let mut bloom = [0u8; BLOOM_FILTER_SIZE];

    for j in 0..3 {
        let mut index = bytes[j] as usize;
        if bytes[3] & (1 << j) != 0 {
            index += 256;
        }
        bloom[index / 8] |= 1 << (index % 8);
    }

    bloom
}

/// Test whether every bit set in `sample` is also set in `filter`.
///
/// An empty or all-zero filter accepts everything.
pub fn bloom_filter_match(filter: &[u8], sample: &[u8]) -> bool {
    if filter.is_empty() || filter.iter().all(|&b| b == 0) {
        return true;
    }

    (0..BLOOM_FILTER_SIZE).all(|i| {
        let f = filter.get(i).copied().unwrap_or(0);
        let s = sample.get(i).copied().unwrap_or(0);
        (f | s) == f
    })
}

/// A filter with every bit set, used by peers that want all topics.
pub fn make_full_node_bloom() -> Bloom {
    [0xFF; BLOOM_FILTER_SIZE]
}

/// Union of two filters.
pub fn add_bloom(a: &Bloom, b: &Bloom) -> Bloom {
    let mut out = [0u8; BLOOM_FILTER_SIZE];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = a[i] | b[i];
    }
    out
}

/// Build a filter that accepts each of the given topics.
pub fn topics_to_bloom<'a>(topics: impl IntoIterator<Item = &'a Topic>) -> Bloom {
    topics
        .into_iter()
        .fold([0u8; BLOOM_FILTER_SIZE], |acc, topic| {
            add_bloom(&acc, &topic_to_bloom(topic))
        })
}

/// Whether a filter accepts every topic.
pub fn is_full_node(bloom: &[u8]) -> bool {
    bloom.is_empty() || (bloom.len() == BLOOM_FILTER_SIZE && bloom.iter().all(|&b| b == 0xFF))
}

/// Validate wire bytes as a bloom filter.
///
/// Zero bytes means "accept all" and yields `None`.
pub fn bloom_from_slice(bytes: &[u8]) -> Result<Option<Bloom>> {
    match bytes.len() {
        0 => Ok(None),
        BLOOM_FILTER_SIZE => {
            let mut bloom = [0u8; BLOOM_FILTER_SIZE];
            bloom.copy_from_slice(bytes);
            Ok(Some(bloom))
        }
        other => Err(CoreError::InvalidBloomSize(other)),
    }
}

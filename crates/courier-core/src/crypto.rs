//! Hashing primitives.
//!
//! Blake3 content-addresses envelopes. SHA-256 hashes the topic namespace
//! inside persisted keys, whose layout is fixed.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::types::{EnvelopeHash, Topic};

/// A 32-byte SHA-256 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha256Hash(pub [u8; 32]);

impl Sha256Hash {
    /// Compute the SHA-256 hash of data.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Get raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SHA256({}...)", &self.to_hex()[..8])
    }
}

/// Hash of a topic's namespace, as stored in the key's second field.
pub fn topic_hash(topic: &Topic) -> Sha256Hash {
    Sha256Hash::hash(topic.as_bytes())
}

/// Blake3 content digest.
pub fn content_digest(data: &[u8]) -> EnvelopeHash {
    EnvelopeHash(*blake3::hash(data).as_bytes())
}

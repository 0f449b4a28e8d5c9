//! Envelopes and their deterministic CBOR encoding.
//!
//! The encoding is an integer-keyed CBOR map written with smallest-width
//! integers and definite lengths, so the same envelope always produces the
//! same bytes and therefore the same [`EnvelopeHash`].

use bytes::Bytes;
use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::bloom::{topic_to_bloom, Bloom};
use crate::crypto::content_digest;
use crate::error::{CoreError, Result};
use crate::types::{EnvelopeHash, Topic, TOPIC_LENGTH};

/// Map keys of the envelope encoding. Keys 0-23 encode as single bytes.
mod keys {
    pub const EXPIRY: u64 = 0;
    pub const TTL: u64 = 1;
    pub const TOPIC: u64 = 2;
    pub const NONCE: u64 = 3;
    pub const PAYLOAD: u64 = 4;
}

/// A sealed, topic-tagged unit of transport.
///
/// The payload is opaque here; encryption happens before an envelope is
/// built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unix seconds after which peers drop the envelope.
    pub expiry: u32,
    /// Time-to-live in seconds.
    pub ttl: u32,
    pub topic: Topic,
    /// Distinguishes otherwise identical envelopes.
    pub nonce: u64,
    pub payload: Bytes,
}

impl Envelope {
    /// Build an envelope claimed to be sent at `timestamp`.
    ///
    /// `ttl` is clamped so that `expiry` fits in a `u32`; the claimed
    /// timestamp is always preserved and `timestamp()` returns it exactly.
    pub fn new(timestamp: u32, ttl: u32, topic: Topic, payload: impl Into<Bytes>) -> Self {
        let ttl = ttl.min(u32::MAX - timestamp);
        Self {
            expiry: timestamp + ttl,
            ttl,
            topic,
            nonce: 0,
            payload: payload.into(),
        }
    }

    /// Set the nonce.
    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    /// Sender-claimed send time in unix seconds.
    pub fn timestamp(&self) -> u32 {
        self.expiry.saturating_sub(self.ttl)
    }

    /// Whether the envelope has expired at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        u64::from(self.expiry) <= now
    }

    /// Content address: Blake3 over the encoded bytes.
    pub fn hash(&self) -> EnvelopeHash {
        content_digest(&self.encode())
    }

    /// Bloom sample of this envelope's topic.
    pub fn bloom(&self) -> Bloom {
        topic_to_bloom(&self.topic)
    }

    /// Encode to deterministic CBOR bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + 32);
        encode_uint(&mut buf, 5, 5);

        encode_uint(&mut buf, 0, keys::EXPIRY);
        encode_uint(&mut buf, 0, u64::from(self.expiry));

        encode_uint(&mut buf, 0, keys::TTL);
        encode_uint(&mut buf, 0, u64::from(self.ttl));

        encode_uint(&mut buf, 0, keys::TOPIC);
        encode_bytes(&mut buf, self.topic.as_bytes());

        encode_uint(&mut buf, 0, keys::NONCE);
        encode_uint(&mut buf, 0, self.nonce);

        encode_uint(&mut buf, 0, keys::PAYLOAD);
        encode_bytes(&mut buf, &self.payload);

        buf
    }

    /// Decode from CBOR bytes.
    ///
    /// Trailing bytes after the map are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(bytes);
        let value: Value =
            ciborium::from_reader(&mut cursor).map_err(|e| CoreError::DecodingError(e.to_string()))?;
        if cursor.position() as usize != bytes.len() {
            return Err(CoreError::DecodingError("trailing bytes after envelope".into()));
        }

        let map = match value {
            Value::Map(m) => m,
            _ => return Err(CoreError::DecodingError("expected map".into())),
        };

        let get = |key: u64| -> Option<&Value> {
            map.iter()
                .find(|(k, _)| match k {
                    Value::Integer(i) => u64::try_from(*i).map(|n| n == key).unwrap_or(false),
                    _ => false,
                })
                .map(|(_, v)| v)
        };

        let expiry = get_uint(get(keys::EXPIRY), "expiry")?;
        let ttl = get_uint(get(keys::TTL), "ttl")?;
        let nonce = get_uint(get(keys::NONCE), "nonce")?;

        let topic = match get(keys::TOPIC) {
            Some(Value::Bytes(b)) if b.len() == TOPIC_LENGTH => {
                let mut arr = [0u8; TOPIC_LENGTH];
                arr.copy_from_slice(b);
                Topic(arr)
            }
            _ => return Err(CoreError::DecodingError("invalid topic".into())),
        };

        let payload = match get(keys::PAYLOAD) {
            Some(Value::Bytes(b)) => Bytes::copy_from_slice(b),
            _ => return Err(CoreError::DecodingError("invalid payload".into())),
        };

        if ttl > expiry {
            return Err(CoreError::DecodingError("ttl exceeds expiry".into()));
        }

        Ok(Self {
            expiry: u32::try_from(expiry)
                .map_err(|_| CoreError::DecodingError("expiry out of range".into()))?,
            ttl: u32::try_from(ttl).map_err(|_| CoreError::DecodingError("ttl out of range".into()))?,
            topic,
            nonce,
            payload,
        })
    }
}

fn get_uint(value: Option<&Value>, field: &str) -> Result<u64> {
    match value {
        Some(Value::Integer(i)) => {
            u64::try_from(*i).map_err(|_| CoreError::DecodingError(format!("invalid {}", field)))
        }
        _ => Err(CoreError::DecodingError(format!("missing {}", field))),
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

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_uint(buf, 2, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// A message the application asked to send, kept so it can be reposted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub topic: Topic,
    pub ttl: u32,
    pub payload: Bytes,
}

impl NewMessage {
    pub fn new(topic: Topic, ttl: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            topic,
            ttl,
            payload: payload.into(),
        }
    }

    /// Seal into an envelope stamped at `now` with a fresh random nonce.
    pub fn seal(&self, now: u32) -> Envelope {
        use rand::Rng;
        Envelope::new(now, self.ttl, self.topic, self.payload.clone())
            .with_nonce(rand::thread_rng().gen())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new(1_700_000_000, 60, Topic::from_u32(0xAABBCCDD), &b"hello"[..]).with_nonce(7)
    }

    #[test]
    fn test_timestamp_is_expiry_minus_ttl() {
        let env = sample();
        assert_eq!(env.expiry, 1_700_000_060);
        assert_eq!(env.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_timestamp_survives_near_max() {
        let claimed = u32::MAX - 10;
        let env = Envelope::new(claimed, 60, Topic::from_u32(1), &b"x"[..]);
        assert_eq!(env.timestamp(), claimed);
        assert_eq!(env.expiry, u32::MAX);
        assert_eq!(env.ttl, 10);

        let sealed = NewMessage::new(Topic::from_u32(1), 60, &b"x"[..]).seal(claimed);
        assert_eq!(sealed.timestamp(), claimed);
    }

    #[test]
    fn test_decode_rejects_ttl_past_expiry() {
        let mut env = sample();
        env.ttl = env.expiry + 1;
        assert!(matches!(
            Envelope::decode(&env.encode()),
            Err(CoreError::DecodingError(_))
        ));
    }

    #[test]
    fn test_decode_encode() {
        let env = sample();
        let decoded = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.hash(), env.hash());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        assert_eq!(sample().encode(), sample().encode());
        assert_ne!(sample().hash(), sample().with_nonce(8).hash());
    }

    #[test]
    fn test_encoding_readable_by_ciborium() {
        let value: Value = ciborium::from_reader(&sample().encode()[..]).unwrap();
        match value {
            Value::Map(entries) => assert_eq!(entries.len(), 5),
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Envelope::decode(b"not cbor at all").is_err());
        assert!(Envelope::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = sample().encode();
        bytes.push(0x00);
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(CoreError::DecodingError(_))
        ));
    }

    #[test]
    fn test_is_expired() {
        let env = sample();
        assert!(!env.is_expired(1_700_000_059));
        assert!(env.is_expired(1_700_000_060));
    }

    #[test]
    fn test_seal_uses_fresh_nonce() {
        let msg = NewMessage::new(Topic::from_u32(1), 30, &b"x"[..]);
        let a = msg.seal(100);
        let b = msg.seal(100);
        assert_eq!(a.timestamp(), 100);
        assert_eq!(a.payload, b.payload);
        // nonces are 64 random bits
        assert_ne!(a.hash(), b.hash());
    }
}

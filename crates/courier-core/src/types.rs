//! Strong type definitions for courier.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Defines a 32-byte identifier newtype with hex helpers.
macro_rules! id32 {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Convert to hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                if bytes.len() != 32 {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }

            /// Generate a random identifier.
            pub fn random() -> Self {
                use rand::Rng;
                Self(rand::thread_rng().gen())
            }

            /// The all-zero identifier (sentinel).
            pub const ZERO: Self = Self([0u8; 32]);
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.to_hex()[..16])
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = CoreError;

            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                let arr: [u8; 32] = slice.try_into().map_err(|_| CoreError::InvalidIdLength {
                    expected: 32,
                    got: slice.len(),
                })?;
                Ok(Self(arr))
            }
        }
    };
}

id32!(
    /// Content address of an envelope: Blake3 over its CBOR encoding.
    ///
    /// Also used for transport batch hashes.
    EnvelopeHash,
    "EnvelopeHash"
);

id32!(
    /// Identity of a remote peer as reported by the transport.
    PeerId,
    "PeerId"
);

id32!(
    /// Application-level message identifier.
    ///
    /// One message may be backed by several envelopes when the
    /// segmentation layer splits it.
    MessageId,
    "MessageId"
);

id32!(
    /// Identifier of a sync group (a chat or a device set).
    GroupId,
    "GroupId"
);

/// Batch hashes share the envelope hash representation.
pub type BatchHash = EnvelopeHash;

/// Length of a topic in bytes.
pub const TOPIC_LENGTH: usize = 4;

/// A 4-byte envelope classifier used for coarse routing and filtering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Topic(pub [u8; TOPIC_LENGTH]);

impl Topic {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; TOPIC_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; TOPIC_LENGTH] {
        &self.0
    }

    /// Build a topic from its big-endian integer form, e.g. `0xAABBCCDD`.
    pub const fn from_u32(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic(0x{})", self.to_hex())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl From<[u8; TOPIC_LENGTH]> for Topic {
    fn from(bytes: [u8; TOPIC_LENGTH]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_id_is_zero() {
        assert_eq!(EnvelopeHash::default(), EnvelopeHash::ZERO);
        assert_eq!(PeerId::default(), PeerId::ZERO);
    }

    #[test]
    fn test_envelope_hash_hex_roundtrip() {
        let hash = EnvelopeHash::from_bytes([0x42; 32]);
        let recovered = EnvelopeHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, recovered);
    }

    #[test]
    fn test_id_display_is_truncated() {
        let peer = PeerId::from_bytes([0xab; 32]);
        assert_eq!(format!("{}", peer), "abababababababab");
        assert!(format!("{:?}", peer).starts_with("PeerId("));
    }

    #[test]
    fn test_id_try_from_wrong_length() {
        let err = MessageId::try_from(&[0u8; 31][..]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidIdLength { expected: 32, got: 31 }
        ));
    }

    #[test]
    fn test_topic_from_u32() {
        let topic = Topic::from_u32(0xAABBCCDD);
        assert_eq!(topic.as_bytes(), &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(topic.to_string(), "0xaabbccdd");
    }
}

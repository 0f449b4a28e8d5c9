//! # Courier Core
//!
//! Pure primitives shared by the courier crates: identifiers, envelopes,
//! the topic bloom index and the time-ordered storage key.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Envelope`] - A topic-tagged unit of transport
//! - [`EnvelopeHash`] - Content address of an envelope (Blake3)
//! - [`Topic`] - 4-byte classifier used for routing and filtering
//! - [`DbKey`] - 72-byte key that sorts by time under byte comparison
//! - [`Bloom`] - 64-byte topic filter

pub mod bloom;
pub mod crypto;
pub mod db_key;
pub mod envelope;
pub mod error;
pub mod time;
pub mod types;

pub use bloom::{
    add_bloom, bloom_filter_match, bloom_from_slice, is_full_node, make_full_node_bloom,
    topic_to_bloom, topics_to_bloom, Bloom, BLOOM_FILTER_SIZE,
};
pub use crypto::{content_digest, topic_hash, Sha256Hash};
pub use db_key::{key_topic_hash, DbKey, DB_KEY_LENGTH};
pub use envelope::{Envelope, NewMessage};
pub use error::{CoreError, Result};
pub use time::{Clock, ManualClock, SystemClock};
pub use types::{BatchHash, EnvelopeHash, GroupId, MessageId, PeerId, Topic, TOPIC_LENGTH};

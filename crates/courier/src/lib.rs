//! # Courier
//!
//! Delivery reliability for gossip messaging: know whether a message was
//! really delivered, and recover what was missed while offline.
//!
//! ## Overview
//!
//! - **Delivery tracking**: locally posted envelopes are followed through
//!   the transport's events until a trusted peer confirms them or they
//!   expire. Expired envelopes can be reposted with backoff.
//! - **Mailserver**: envelopes are archived under time-ordered keys and
//!   served back through a paginated, bloom-filtered range query.
//! - **Sync ledger**: per-peer send accounting for multi-device sync.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use courier::{Node, NodeConfig};
//! use courier::core::{MessageId, NewMessage, Topic};
//! use courier::store::SqliteStore;
//!
//! async fn example() -> courier::Result<()> {
//!     let config = NodeConfig::from_file("courier.json")?;
//!     let store = Arc::new(SqliteStore::open("courier.db")?);
//!     let node = Node::new(config, store)?;
//!     let handle = node.start();
//!
//!     let message = NewMessage::new(Topic::from_u32(0xAABBCCDD), 60, b"hello".to_vec());
//!     let envelope = node.post(&[MessageId::random()], message);
//!     // publish `envelope`, forward transport events to `handle.events()`
//!
//!     handle.shutdown().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `courier::core` - identifiers, envelopes, bloom index, storage keys
//! - `courier::store` - ordered key-value stores and retention
//! - `courier::mailserver` - archive and history replay
//! - `courier::delivery` - envelope tracker and sync ledger

pub mod config;
pub mod error;
pub mod node;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::{Node, NodeBuilder, NodeHandle};

pub use courier_core as core;
pub use courier_delivery as delivery;
pub use courier_mailserver as mailserver;
pub use courier_store as store;

pub use courier_core::{
    bloom_filter_match, make_full_node_bloom, topic_to_bloom, DbKey, Envelope, EnvelopeHash,
    MessageId, NewMessage, PeerId, Topic,
};
pub use courier_delivery::{
    DeliveryError, DeliveryHandler, EnvelopeEvent, EnvelopeState, EnvelopeTracker, SyncLedger,
};
pub use courier_mailserver::{
    CancelToken, MailServerResponse, Mailserver, MailserverError, MessagesRequest,
    SyncMailRequest,
};
pub use courier_store::{KvStore, MemoryStore, SqliteStore};

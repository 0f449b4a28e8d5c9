//! # Courier Delivery
//!
//! Delivery guarantees on top of a best-effort gossip transport.
//!
//! - [`EnvelopeTracker`] follows locally posted envelopes through their
//!   lifecycle and gives the application one authoritative state per
//!   envelope, honoring confirmations only from trusted peers.
//! - [`SyncLedger`] keeps per-peer send accounting for multi-device sync
//!   and decides when a message is due for retransmission.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use courier_core::{EnvelopeHash, MessageId, NewMessage, Topic};
//! use courier_delivery::{EnvelopeTracker, StaticMailservers, TrackerConfig};
//!
//! async fn example(hash: EnvelopeHash, id: MessageId) {
//!     let mailservers = Arc::new(StaticMailservers::default());
//!     let tracker = Arc::new(EnvelopeTracker::new(
//!         TrackerConfig::default().with_mailserver_confirmations(true),
//!         mailservers,
//!     ));
//!
//!     let message = NewMessage::new(Topic::from_u32(1), 60, b"hi".to_vec());
//!     tracker.add(&[id], hash, message);
//!
//!     // feed transport events through `spawn_dispatcher`, then:
//!     let _ = tracker.wait_for_confirmation(&hash, Duration::from_secs(30)).await;
//! }
//! ```

pub mod error;
pub mod events;
pub mod handler;
pub mod sync_state;
pub mod tracker;
pub mod trust;

pub use error::{DeliveryError, Result};
pub use events::{EnvelopeError, EnvelopeErrorCode, EnvelopeEvent};
pub use handler::{DeliveryHandler, EnvelopePoster};
pub use sync_state::{LedgerConfig, SyncKey, SyncLedger, SyncState};
pub use tracker::{EnvelopeState, EnvelopeTracker, TrackerConfig};
pub use trust::{MailserverRegistry, StaticMailservers, TrustPolicy};

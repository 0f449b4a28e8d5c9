//! # Courier Mailserver
//!
//! Envelope archive and history server.
//!
//! ## Overview
//!
//! A mailserver stores every envelope it sees under a [`DbKey`] so that
//! archive order is time order. Clients that were offline ask for a time
//! range, optionally narrowed by a topic bloom filter, and receive the
//! matching envelopes in pages of at most `limit`. Each page that stops
//! early carries a cursor; the next request resumes right after it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use courier_core::{PeerId, SystemClock};
//! use courier_mailserver::{CancelToken, Mailserver, MailserverConfig, MessagesRequest};
//! use courier_mailserver::transport::memory::RecordingSink;
//! use courier_store::MemoryStore;
//!
//! async fn example() {
//!     let server = Mailserver::new(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(SystemClock),
//!         MailserverConfig::default(),
//!     );
//!     let sink = RecordingSink::new();
//!     let request = MessagesRequest::new(0, 0).with_limit(100);
//!     let response = server
//!         .deliver_mail(&PeerId::ZERO, &request, &sink, &CancelToken::new())
//!         .await;
//!     if response.has_more() {
//!         // send `request.with_cursor(response.cursor)` next
//!     }
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Client                              Mailserver
//!   |-------- MessagesRequest -------->|
//!   |<------- envelope bundle ---------|
//!   |<------- envelope bundle ---------|
//!   |<------- MailServerResponse ------|   cursor set: more to fetch
//!   |-------- MessagesRequest -------->|   with cursor
//!   |<------- envelope bundle ---------|
//!   |<------- MailServerResponse ------|   cursor empty: done
//! ```
//!
//! [`DbKey`]: courier_core::DbKey

pub mod cancel;
pub mod error;
pub mod messages;
pub mod rate_limiter;
pub mod replication;
pub mod server;
pub mod traffic;
pub mod transport;

pub use cancel::CancelToken;
pub use error::{MailserverError, Result};
pub use messages::{
    decode_message, encode_message, limits, validate_cursor, MailServerResponse,
    MessagesRequest, RequestId, SyncEventResponse, SyncMailRequest,
};
pub use rate_limiter::PeerRateLimiter;
pub use replication::{replicate, ArchiveSink, ReplicationReport};
pub use server::{Mailserver, MailserverConfig, Query, QueryOutcome};
pub use traffic::{Direction, TrafficConfig, TrafficObserver};
pub use transport::EnvelopeSink;

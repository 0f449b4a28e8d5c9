//! # Courier Store
//!
//! Ordered key-value storage for the envelope archive. The mailserver
//! persists envelopes under 72-byte time-ordered keys and reads them back
//! with ascending range scans.
//!
//! ## Key Types
//!
//! - [`KvStore`] - Async trait for an ordered byte-range store
//! - [`EnvelopeStoreExt`] - Envelope-level helpers on any `KvStore`
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage
//! - [`RetentionCleaner`] - Background age-based pruning
//!
//! ## Usage
//!
//! ```rust,no_run
//! use courier_core::{Envelope, Topic};
//! use courier_store::{EnvelopeStoreExt, KvStore, SqliteStore};
//!
//! async fn example() {
//!     let store = SqliteStore::open("mail.db").unwrap();
//!     let envelope = Envelope::new(1_700_000_000, 60, Topic::from_u32(1), &b"hi"[..]);
//!     let key = store.save_envelope(&envelope).await.unwrap();
//!     assert!(store.load_envelope(&key).await.unwrap().is_some());
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod retention;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use retention::{RetentionCleaner, RetentionConfig};
pub use sqlite::SqliteStore;
pub use traits::{decode_stored, Entry, EnvelopeStoreExt, KeyRange, KvStore};

//! # Courier Testkit
//!
//! Testing utilities for courier.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: bloom samples and storage keys whose bytes are fixed
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: a mailserver over a memory store plus a pagination driver
//!
//! ## Golden Vectors
//!
//! ```rust
//! use courier_testkit::vectors::verify_all_vectors;
//!
//! assert!(verify_all_vectors().is_empty());
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use courier_testkit::generators::{envelope_from_params, EnvelopeParams};
//!
//! proptest! {
//!     #[test]
//!     fn hash_is_deterministic(params: EnvelopeParams) {
//!         let a = envelope_from_params(&params);
//!         let b = envelope_from_params(&params);
//!         prop_assert_eq!(a.hash(), b.hash());
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use courier_core::PeerId;
//! use courier_mailserver::MessagesRequest;
//! use courier_testkit::fixtures::{TestFixture, SCENARIO_TOPIC};
//!
//! async fn example() {
//!     let fixture = TestFixture::new(1_000);
//!     fixture.seed(&[(100, SCENARIO_TOPIC), (200, SCENARIO_TOPIC)]).await;
//!     let pages = fixture
//!         .fetch_all(&PeerId::ZERO, MessagesRequest::new(1, 500).with_limit(1))
//!         .await;
//!     assert_eq!(pages.timestamps(), vec![100, 200]);
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub use fixtures::{fetch_all, Pages, TestFixture, SCENARIO_TOPIC};
pub use generators::{envelope_from_params, materialize, EnvelopeParams};
pub use vectors::{bloom_vectors, key_vectors, verify_all_vectors, BloomVector, KeyVector};

static INIT_LOGGING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

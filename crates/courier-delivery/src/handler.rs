//! Application-facing callbacks and the repost seam used for retries.

use async_trait::async_trait;
use courier_core::{EnvelopeHash, MessageId, NewMessage};

use crate::error::{DeliveryError, Result};

/// Receives per-message delivery outcomes.
///
/// Called from the tracker's event context, never while its lock is held.
/// Implementations should return quickly.
pub trait DeliveryHandler: Send + Sync {
    /// Every envelope backing these messages is confirmed.
    fn envelope_sent(&self, message_ids: &[MessageId]);

    /// These messages will not be delivered.
    fn envelope_expired(&self, message_ids: &[MessageId], error: &DeliveryError);
}

/// Hands a message back to the transport for another attempt.
#[async_trait]
pub trait EnvelopePoster: Send + Sync {
    /// Post `message`, returning the hash of the new envelope.
    async fn post(&self, message: &NewMessage) -> Result<EnvelopeHash>;
}

/// Handlers for tests and local wiring.
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    use courier_core::{Clock, Envelope};

    /// Records every callback.
    #[derive(Debug, Default)]
    pub struct RecordingHandler {
        sent: Mutex<Vec<MessageId>>,
        expired: Mutex<Vec<(MessageId, DeliveryError)>>,
    }

    impl RecordingHandler {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<MessageId> {
            self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        pub fn expired(&self) -> Vec<(MessageId, DeliveryError)> {
            self.expired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl DeliveryHandler for RecordingHandler {
        fn envelope_sent(&self, message_ids: &[MessageId]) {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(message_ids);
        }

        fn envelope_expired(&self, message_ids: &[MessageId], error: &DeliveryError) {
            self.expired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(message_ids.iter().map(|id| (*id, error.clone())));
        }
    }

    /// Seals each message with the clock's time and records the result.
    /// Fails every post while `failing` is set.
    pub struct SealingPoster {
        clock: Arc<dyn Clock>,
        posted: Mutex<Vec<Envelope>>,
        failing: AtomicBool,
        attempts: AtomicU32,
    }

    impl SealingPoster {
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                clock,
                posted: Mutex::new(Vec::new()),
                failing: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Envelopes successfully posted, in order.
        pub fn posted(&self) -> Vec<Envelope> {
            self.posted.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        /// Every call to `post`, successful or not.
        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EnvelopePoster for SealingPoster {
        async fn post(&self, message: &NewMessage) -> Result<EnvelopeHash> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(DeliveryError::Post("transport unavailable".into()));
            }
            let now = u32::try_from(self.clock.now_secs()).unwrap_or(u32::MAX);
            let envelope = message.seal(now);
            let hash = envelope.hash();
            self.posted
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(envelope);
            Ok(hash)
        }
    }
}

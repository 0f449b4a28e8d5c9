//! Error types for delivery tracking.

use courier_core::EnvelopeHash;
use thiserror::Error;

/// Why an envelope did not reach the confirmed state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The transport gave up on the envelope.
    #[error("envelope {0} expired due to connectivity issues")]
    Expired(EnvelopeHash),

    /// A trusted peer acknowledged the batch but refused this envelope.
    #[error("envelope {hash} rejected: {reason}")]
    Rejected { hash: EnvelopeHash, reason: String },

    /// No confirmation arrived before the caller's deadline.
    #[error("timed out waiting for confirmation of {0}")]
    Timeout(EnvelopeHash),

    /// The hash is not tracked (never added, or already removed).
    #[error("envelope {0} is not tracked")]
    NotTracked(EnvelopeHash),

    /// Reposting a message for retry failed.
    #[error("failed to post envelope: {0}")]
    Post(String),
}

impl DeliveryError {
    /// Terminal failures reported by the transport, as opposed to the
    /// caller's own deadline or bookkeeping.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            DeliveryError::Expired(_) | DeliveryError::Rejected { .. } | DeliveryError::Post(_)
        )
    }
}

/// Result type for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

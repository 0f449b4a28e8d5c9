//! Lifecycle events emitted by the transport for locally posted envelopes.

use courier_core::{BatchHash, EnvelopeHash, PeerId};

/// Why a peer refused an envelope inside an acknowledged batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeErrorCode {
    /// The peer's clock disagrees with the envelope timestamp.
    TimeNotSynced,
    Other,
}

/// A per-envelope rejection carried by a batch acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeError {
    pub hash: EnvelopeHash,
    pub code: EnvelopeErrorCode,
    pub description: String,
}

impl EnvelopeError {
    pub fn new(hash: EnvelopeHash, code: EnvelopeErrorCode, description: impl Into<String>) -> Self {
        Self {
            hash,
            code,
            description: description.into(),
        }
    }

    /// Human-readable reason used when failing the envelope.
    pub fn reason(&self) -> String {
        match self.code {
            EnvelopeErrorCode::TimeNotSynced => {
                "envelope wasn't delivered due to time sync issues".to_string()
            }
            EnvelopeErrorCode::Other => self.description.clone(),
        }
    }
}

/// Transport notification about an envelope or batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeEvent {
    /// The envelope left the node. With a `batch`, confirmation is deferred
    /// until that batch is acknowledged.
    Sent {
        hash: EnvelopeHash,
        batch: Option<BatchHash>,
        peer: PeerId,
    },
    /// The transport gave up on the envelope.
    Expired { hash: EnvelopeHash },
    /// `peer` reported already holding the envelope.
    Received { hash: EnvelopeHash, peer: PeerId },
    /// `peer` confirmed every envelope in `batch` except those in `errors`.
    BatchAcknowledged {
        batch: BatchHash,
        peer: PeerId,
        errors: Vec<EnvelopeError>,
    },
}

impl EnvelopeEvent {
    pub fn sent(hash: EnvelopeHash, peer: PeerId) -> Self {
        EnvelopeEvent::Sent {
            hash,
            batch: None,
            peer,
        }
    }

    pub fn sent_in_batch(hash: EnvelopeHash, batch: BatchHash, peer: PeerId) -> Self {
        EnvelopeEvent::Sent {
            hash,
            batch: Some(batch),
            peer,
        }
    }

    pub fn acknowledged(batch: BatchHash, peer: PeerId) -> Self {
        EnvelopeEvent::BatchAcknowledged {
            batch,
            peer,
            errors: Vec::new(),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopeEvent::Sent { .. } => "sent",
            EnvelopeEvent::Expired { .. } => "expired",
            EnvelopeEvent::Received { .. } => "received",
            EnvelopeEvent::BatchAcknowledged { .. } => "batch_acknowledged",
        }
    }
}

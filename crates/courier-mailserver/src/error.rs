//! Error types for the mailserver.

use courier_core::{CoreError, Topic};
use courier_store::StoreError;
use thiserror::Error;

/// Errors raised while archiving or serving history.
///
/// None of these cross the peer boundary as values: protocol entry points
/// render them into the response `error` string.
#[derive(Debug, Error)]
pub enum MailserverError {
    /// Requested more envelopes than one response may carry.
    #[error("limit {limit} exceeds maximum {max}")]
    LimitExceeded { limit: u32, max: u32 },

    /// Bloom filter had a length other than 0 or 64 bytes.
    #[error("invalid bloom filter size: {0}")]
    InvalidBloomSize(usize),

    /// `from` is after `to`.
    #[error("query range is invalid: from > to ({from} > {to})")]
    InvalidTimeRange { from: u32, to: u32 },

    /// The range spans more than the server allows.
    #[error("query range of {range}s exceeds maximum {max}s")]
    QueryRangeTooLarge { range: u64, max: u64 },

    /// Cursor is not a storage key.
    #[error("invalid cursor length: {0}")]
    InvalidCursor(usize),

    /// Request failed validation for another reason.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Peer sent requests faster than allowed.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Egress budget for a topic is exhausted.
    #[error("throttled: egress budget for topic {0} is drained")]
    Throttled(Topic),

    /// Storage failed or returned corrupt data.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Pushing envelopes to the peer failed.
    #[error("sink error: {0}")]
    Sink(String),

    /// Pushing a bundle to the peer took too long.
    #[error("timed out sending envelopes")]
    SendTimeout,

    /// The request was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,

    /// The remote mailserver reported a failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// Wire encoding failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl MailserverError {
    /// A problem with the request itself. Retrying unchanged will fail again.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MailserverError::LimitExceeded { .. }
                | MailserverError::InvalidBloomSize(_)
                | MailserverError::InvalidTimeRange { .. }
                | MailserverError::QueryRangeTooLarge { .. }
                | MailserverError::InvalidCursor(_)
                | MailserverError::InvalidRequest(_)
        )
    }

    /// The caller may retry later and expect success.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MailserverError::RateLimited
                | MailserverError::Throttled(_)
                | MailserverError::SendTimeout
                | MailserverError::Sink(_)
        )
    }
}

impl From<CoreError> for MailserverError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidBloomSize(n) => MailserverError::InvalidBloomSize(n),
            CoreError::InvalidKeyLength { got, .. } => MailserverError::InvalidCursor(got),
            other => MailserverError::Codec(other.to_string()),
        }
    }
}

/// Result type for mailserver operations.
pub type Result<T> = std::result::Result<T, MailserverError>;

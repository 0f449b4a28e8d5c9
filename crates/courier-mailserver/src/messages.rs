//! Mailserver wire messages.
//!
//! Requests carry a time range, a bloom filter, a limit and an opaque
//! cursor. Responses carry the continuation cursor; the matched envelopes
//! themselves travel out of band through the peer's normal send path.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use courier_core::{bloom_from_slice, Bloom, EnvelopeHash, DB_KEY_LENGTH};

use crate::error::{MailserverError, Result};

/// Request and response limits.
pub mod limits {
    /// Max envelopes one response may carry.
    pub const MAX_LIMIT_IN_MESSAGES_REQUEST: u32 = 1000;
    /// Width of the window used when a request leaves `from` unset.
    pub const DEFAULT_QUERY_WINDOW_SECS: u32 = 24 * 60 * 60;
    /// Default upper bound on one bundle of envelopes, in bytes.
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
}

/// Correlates a request with its response.
pub type RequestId = EnvelopeHash;

/// A client's request for history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub id: RequestId,
    /// Lower time bound in unix seconds. Zero means `to - 24h`.
    pub from: u32,
    /// Upper time bound in unix seconds, inclusive. Zero means now.
    pub to: u32,
    /// Max envelopes to return. Zero means the server maximum.
    pub limit: u32,
    /// Continuation token from a previous response. Empty to start.
    pub cursor: Vec<u8>,
    /// Topic filter, 64 bytes. Empty accepts every topic.
    pub bloom: Vec<u8>,
}

impl MessagesRequest {
    /// A request for `[from, to]` with a fresh random id.
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            id: RequestId::random(),
            from,
            to,
            limit: 0,
            cursor: Vec::new(),
            bloom: Vec::new(),
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_bloom(mut self, bloom: Bloom) -> Self {
        self.bloom = bloom.to_vec();
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<Vec<u8>>) -> Self {
        self.cursor = cursor.into();
        self
    }
}

/// Server-to-server replication request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMailRequest {
    /// Lower time bound in unix seconds.
    pub lower: u32,
    /// Upper time bound in unix seconds, inclusive.
    pub upper: u32,
    pub bloom: Vec<u8>,
    pub limit: u32,
    pub cursor: Vec<u8>,
}

impl SyncMailRequest {
    pub fn new(lower: u32, upper: u32, limit: u32) -> Self {
        Self {
            lower,
            upper,
            bloom: Vec::new(),
            limit,
            cursor: Vec::new(),
        }
    }

    pub fn with_bloom(mut self, bloom: Bloom) -> Self {
        self.bloom = bloom.to_vec();
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<Vec<u8>>) -> Self {
        self.cursor = cursor.into();
        self
    }

    /// Structural checks that need no server state.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(MailserverError::InvalidRequest("limit must be positive".into()));
        }
        if self.limit > limits::MAX_LIMIT_IN_MESSAGES_REQUEST {
            return Err(MailserverError::LimitExceeded {
                limit: self.limit,
                max: limits::MAX_LIMIT_IN_MESSAGES_REQUEST,
            });
        }
        if self.lower > self.upper {
            return Err(MailserverError::InvalidTimeRange {
                from: self.lower,
                to: self.upper,
            });
        }
        validate_cursor(&self.cursor)?;
        bloom_from_slice(&self.bloom)?;
        Ok(())
    }
}

/// Reject cursors that cannot be a storage key.
pub fn validate_cursor(cursor: &[u8]) -> Result<()> {
    if !cursor.is_empty() && cursor.len() != DB_KEY_LENGTH {
        return Err(MailserverError::InvalidCursor(cursor.len()));
    }
    Ok(())
}

/// Completion message for a [`MessagesRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServerResponse {
    pub request_id: RequestId,
    /// Hash of the last envelope sent, zero if none.
    pub last_envelope_hash: EnvelopeHash,
    /// Continuation token. Empty when the range is exhausted.
    pub cursor: Vec<u8>,
    /// Empty on success.
    pub error: String,
}

impl MailServerResponse {
    pub fn success(request_id: RequestId, last_envelope_hash: EnvelopeHash, cursor: Vec<u8>) -> Self {
        Self {
            request_id,
            last_envelope_hash,
            cursor,
            error: String::new(),
        }
    }

    pub fn failure(request_id: RequestId, error: &MailserverError) -> Self {
        Self {
            request_id,
            last_envelope_hash: EnvelopeHash::ZERO,
            cursor: Vec::new(),
            error: error.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }

    /// Whether another page is available.
    pub fn has_more(&self) -> bool {
        self.is_ok() && !self.cursor.is_empty()
    }
}

/// Final message of a [`SyncMailRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncEventResponse {
    pub cursor: Vec<u8>,
    pub error: String,
}

impl SyncEventResponse {
    pub fn success(cursor: Vec<u8>) -> Self {
        Self {
            cursor,
            error: String::new(),
        }
    }

    pub fn failure(error: &MailserverError) -> Self {
        Self {
            cursor: Vec::new(),
            error: error.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// Encode a wire message as CBOR.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| MailserverError::Codec(e.to_string()))?;
    Ok(buf)
}

/// Decode a CBOR wire message.
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| MailserverError::Codec(e.to_string()))
}

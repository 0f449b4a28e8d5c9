//! Store traits: an ordered byte-range store and envelope helpers on top.
//!
//! The mailserver never sorts. Everything it needs from storage is an
//! ascending scan over a half-open key range, which any ordered
//! key-value engine can provide.

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{key_topic_hash, topic_hash, DbKey, Envelope, Topic};

use crate::error::{Result, StoreError};

/// A half-open key range `[start, end)` under byte-wise comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// All keys with `start <= timestamp < end`.
    pub fn time(start: u64, end: u64) -> Self {
        Self::new(
            DbKey::boundary(start).to_bytes().to_vec(),
            DbKey::boundary(end).to_bytes().to_vec(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }
}

/// A key and its stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Bytes,
}

/// An ordered key-value store.
///
/// Keys compare byte-wise. All scans are ascending and bounded so that a
/// caller can page through a large range without holding the store.
#[async_trait]
pub trait KvStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Point Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Write a value, replacing any previous value under the key.
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &[u8]) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Range Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Up to `limit` entries in `range`, in ascending key order.
    async fn scan(&self, range: &KeyRange, limit: usize) -> Result<Vec<Entry>>;

    /// Up to `limit` keys in `range`, in ascending order, without values.
    async fn scan_keys(&self, range: &KeyRange, limit: usize) -> Result<Vec<Vec<u8>>>;

    /// Number of keys in `range`.
    async fn count(&self, range: &KeyRange) -> Result<u64>;

    /// Delete up to `limit` of the lowest keys in `range`. Returns how many
    /// were removed.
    async fn delete_range(&self, range: &KeyRange, limit: usize) -> Result<u64>;

    /// Total number of keys.
    async fn len(&self) -> Result<u64>;
}

/// Page size used when walking keys for counts and pruning.
const WALK_PAGE: usize = 1000;

/// Envelope-level helpers for any [`KvStore`].
pub trait EnvelopeStoreExt: KvStore {
    /// Archive an envelope under its [`DbKey`].
    fn save_envelope(
        &self,
        envelope: &Envelope,
    ) -> impl std::future::Future<Output = Result<DbKey>> + Send;

    /// Load and decode the envelope stored under `key`.
    fn load_envelope(
        &self,
        key: &DbKey,
    ) -> impl std::future::Future<Output = Result<Option<Envelope>>> + Send;

    /// Count envelopes with `start <= timestamp < end`, optionally only
    /// those on `topic`. The topic filter reads the key, not the value.
    fn count_envelopes(
        &self,
        start: u64,
        end: u64,
        topic: Option<Topic>,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// Delete every envelope older than `timestamp`, in batches of
    /// `batch_size`. Returns how many were removed.
    fn prune_before(
        &self,
        timestamp: u64,
        batch_size: usize,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;
}

impl<S: KvStore + ?Sized> EnvelopeStoreExt for S {
    async fn save_envelope(&self, envelope: &Envelope) -> Result<DbKey> {
        let key = DbKey::for_envelope(envelope);
        self.put(&key.to_bytes(), &envelope.encode()).await?;
        Ok(key)
    }

    async fn load_envelope(&self, key: &DbKey) -> Result<Option<Envelope>> {
        let bytes = key.to_bytes();
        match self.get(&bytes).await? {
            Some(value) => decode_stored(&bytes, &value).map(Some),
            None => Ok(None),
        }
    }

    async fn count_envelopes(&self, start: u64, end: u64, topic: Option<Topic>) -> Result<u64> {
        let range = KeyRange::time(start, end);
        let Some(topic) = topic else {
            return self.count(&range).await;
        };

        let wanted = topic_hash(&topic);
        let mut total = 0u64;
        let mut page_range = range.clone();
        loop {
            let keys = self.scan_keys(&page_range, WALK_PAGE).await?;
            total += keys
                .iter()
                .filter(|k| key_topic_hash(k) == Some(&wanted.0[..]))
                .count() as u64;

            match keys.last() {
                Some(last) if keys.len() == WALK_PAGE => {
                    page_range.start = DbKey::cursor_successor(last);
                }
                _ => break,
            }
        }
        Ok(total)
    }

    async fn prune_before(&self, timestamp: u64, batch_size: usize) -> Result<u64> {
        let range = KeyRange::time(0, timestamp);
        let batch_size = batch_size.max(1);
        let mut removed = 0u64;
        loop {
            let n = self.delete_range(&range, batch_size).await?;
            removed += n;
            if (n as usize) < batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }
        Ok(removed)
    }
}

/// Decode a stored value, reporting the key on failure.
pub fn decode_stored(key: &[u8], value: &[u8]) -> Result<Envelope> {
    Envelope::decode(value).map_err(|e| StoreError::CorruptEnvelope {
        key: hex::encode(&key[..key.len().min(16)]),
        reason: e.to_string(),
    })
}

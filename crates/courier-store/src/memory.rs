//! In-memory implementation of the KvStore trait.
//!
//! Same ordering semantics as SQLite, no persistence. Used in tests and by
//! nodes that do not archive to disk.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::traits::{Entry, KeyRange, KvStore};

/// In-memory ordered store backed by a `BTreeMap`.
pub struct MemoryStore {
    inner: RwLock<BTreeMap<Vec<u8>, Bytes>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<Vec<u8>, Bytes>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Bytes>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn bounds(range: &KeyRange) -> (Bound<&[u8]>, Bound<&[u8]>) {
    (
        Bound::Included(range.start.as_slice()),
        Bound::Excluded(range.end.as_slice()),
    )
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write().insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.read().get(key).cloned())
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        Ok(self.write().remove(key).is_some())
    }

    async fn scan(&self, range: &KeyRange, limit: usize) -> Result<Vec<Entry>> {
        // BTreeMap::range panics on inverted bounds
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.read();
        Ok(inner
            .range::<[u8], _>(bounds(range))
            .take(limit)
            .map(|(k, v)| Entry {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    async fn scan_keys(&self, range: &KeyRange, limit: usize) -> Result<Vec<Vec<u8>>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.read();
        Ok(inner
            .range::<[u8], _>(bounds(range))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn count(&self, range: &KeyRange) -> Result<u64> {
        if range.is_empty() {
            return Ok(0);
        }
        Ok(self.read().range::<[u8], _>(bounds(range)).count() as u64)
    }

    async fn delete_range(&self, range: &KeyRange, limit: usize) -> Result<u64> {
        if range.is_empty() {
            return Ok(0);
        }
        let mut inner = self.write();
        let doomed: Vec<Vec<u8>> = inner
            .range::<[u8], _>(bounds(range))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::EnvelopeStoreExt;
    use courier_core::{DbKey, Envelope, Topic};

    fn envelope(ts: u32, topic: u32, body: &'static [u8]) -> Envelope {
        Envelope::new(ts, 60, Topic::from_u32(topic), body)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put(b"a", b"1").await.unwrap();

        assert_eq!(store.get(b"a").await.unwrap(), Some(Bytes::from_static(b"1")));
        assert!(store.delete(b"a").await.unwrap());
        assert!(!store.delete(b"a").await.unwrap());
        assert_eq!(store.get(b"a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_is_ordered_half_open_and_bounded() {
        let store = MemoryStore::new();
        for k in [b"d", b"a", b"c", b"b", b"e"] {
            store.put(k, b"v").await.unwrap();
        }

        let range = KeyRange::new(b"b".to_vec(), b"e".to_vec());
        let keys: Vec<_> = store
            .scan(&range, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        assert_eq!(store.scan(&range, 2).await.unwrap().len(), 2);
        assert_eq!(store.count(&range).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_inverted_range_is_empty() {
        let store = MemoryStore::new();
        store.put(b"m", b"v").await.unwrap();
        let range = KeyRange::new(b"z".to_vec(), b"a".to_vec());

        assert!(store.scan(&range, 10).await.unwrap().is_empty());
        assert_eq!(store.count(&range).await.unwrap(), 0);
        assert_eq!(store.delete_range(&range, 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_range_respects_limit() {
        let store = MemoryStore::new();
        for i in 0u8..10 {
            store.put(&[i], b"v").await.unwrap();
        }
        let range = KeyRange::new(vec![0u8], vec![10u8]);

        assert_eq!(store.delete_range(&range, 4).await.unwrap(), 4);
        assert_eq!(store.len().await.unwrap(), 6);
        let first = store.scan(&range, 1).await.unwrap();
        assert_eq!(first[0].key, vec![4u8]);
    }

    #[tokio::test]
    async fn test_envelope_save_load() {
        let store = MemoryStore::new();
        let env = envelope(100, 0xAABBCCDD, b"hi");
        let key = store.save_envelope(&env).await.unwrap();

        assert_eq!(key.timestamp(), 100);
        assert_eq!(store.load_envelope(&key).await.unwrap(), Some(env));
        assert_eq!(
            store.load_envelope(&DbKey::boundary(5)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_count_envelopes_by_topic() {
        let store = MemoryStore::new();
        store.save_envelope(&envelope(100, 1, b"a")).await.unwrap();
        store.save_envelope(&envelope(200, 2, b"b")).await.unwrap();
        store.save_envelope(&envelope(300, 1, b"c")).await.unwrap();

        assert_eq!(store.count_envelopes(0, 400, None).await.unwrap(), 3);
        assert_eq!(
            store
                .count_envelopes(0, 400, Some(Topic::from_u32(1)))
                .await
                .unwrap(),
            2
        );
        // end is exclusive
        assert_eq!(store.count_envelopes(100, 300, None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_prune_before() {
        let store = MemoryStore::new();
        for ts in [10u32, 20, 30, 40, 50] {
            store.save_envelope(&envelope(ts, 1, b"x")).await.unwrap();
        }

        assert_eq!(store.prune_before(35, 2).await.unwrap(), 3);
        assert_eq!(store.count_envelopes(0, 100, None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_value_is_reported() {
        let store = MemoryStore::new();
        let key = DbKey::boundary(7);
        store.put(&key.to_bytes(), b"\xff\xff").await.unwrap();

        let err = store.load_envelope(&key).await.unwrap_err();
        assert!(matches!(err, crate::StoreError::CorruptEnvelope { .. }));
    }
}

//! Per-topic traffic accounting.
//!
//! Each `(Direction, Topic)` pair owns a token bucket measured in bytes.
//! Buckets refill continuously up to `capacity`. `observe` always records
//! the traffic, so a large envelope can push a bucket into debt (bounded
//! by `max_debt`); the topic then stays drained until the debt is repaid.
//!
//! Lookups share a read lock on the bucket map. Each bucket has its own
//! mutex, so two topics never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use courier_core::Topic;
use tokio::time::Instant;
use tracing::debug;

/// Default bucket size: 10 MiB per topic and direction.
pub const DEFAULT_CAPACITY_BYTES: u64 = 10 * 1024 * 1024;

/// Default refill rate: 1 MiB/s.
pub const DEFAULT_REFILL_BYTES_PER_SEC: u64 = 1024 * 1024;

/// Requests with a limit above this consult the egress buckets.
pub const DEFAULT_THROTTLE_THRESHOLD: u32 = 100;

/// Which way the traffic flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Envelopes arriving for archival.
    Ingress,
    /// Envelopes served from the archive.
    Egress,
}

/// Configuration for the traffic observer.
#[derive(Debug, Clone)]
pub struct TrafficConfig {
    /// Maximum tokens (bytes) a bucket holds.
    pub capacity: u64,
    /// Bytes restored per second.
    pub refill_per_sec: u64,
    /// How far below zero a bucket may go.
    pub max_debt: u64,
    /// Requests with `limit` above this are subject to egress throttling.
    pub throttle_threshold: u32,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY_BYTES,
            refill_per_sec: DEFAULT_REFILL_BYTES_PER_SEC,
            max_debt: DEFAULT_CAPACITY_BYTES,
            throttle_threshold: DEFAULT_THROTTLE_THRESHOLD,
        }
    }
}

impl TrafficConfig {
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_refill_per_sec(mut self, refill_per_sec: u64) -> Self {
        self.refill_per_sec = refill_per_sec;
        self
    }

    pub fn with_max_debt(mut self, max_debt: u64) -> Self {
        self.max_debt = max_debt;
        self
    }

    pub fn with_throttle_threshold(mut self, threshold: u32) -> Self {
        self.throttle_threshold = threshold;
        self
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: u64, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, config: &TrafficConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_sec as f64).min(config.capacity as f64);
        self.last_refill = now;
    }

    fn consume(&mut self, bytes: u64, config: &TrafficConfig) {
        self.tokens = (self.tokens - bytes as f64).max(-(config.max_debt as f64));
    }

    fn is_drained(&self) -> bool {
        self.tokens <= 0.0
    }
}

type BucketKey = (Direction, Topic);

/// Token-bucket accounting per direction and topic.
pub struct TrafficObserver {
    config: TrafficConfig,
    buckets: RwLock<HashMap<BucketKey, Arc<Mutex<TokenBucket>>>>,
}

impl TrafficObserver {
    pub fn new(config: TrafficConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TrafficConfig {
        &self.config
    }

    fn bucket(&self, key: BucketKey) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return bucket.clone();
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket::full(self.config.capacity, Instant::now())))
            })
            .clone()
    }

    /// Run `f` on the refilled bucket for `key` under its lock.
    fn with_bucket<T>(&self, key: BucketKey, f: impl FnOnce(&mut TokenBucket) -> T) -> T {
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.refill(&self.config, Instant::now());
        f(&mut bucket)
    }

    /// Record `bytes` of traffic. Never refuses.
    pub fn observe(&self, direction: Direction, topic: &Topic, bytes: u64) {
        self.with_bucket((direction, *topic), |b| b.consume(bytes, &self.config));
    }

    /// Whether the bucket has no tokens left.
    pub fn drained(&self, direction: Direction, topic: &Topic) -> bool {
        self.with_bucket((direction, *topic), |b| b.is_drained())
    }

    /// Record `bytes` only if the bucket is not drained. Check and consume
    /// happen under one lock.
    pub fn try_observe(&self, direction: Direction, topic: &Topic, bytes: u64) -> bool {
        self.with_bucket((direction, *topic), |b| {
            if b.is_drained() {
                false
            } else {
                b.consume(bytes, &self.config);
                true
            }
        })
    }

    /// Current token count, after refill.
    pub fn available(&self, direction: Direction, topic: &Topic) -> f64 {
        self.with_bucket((direction, *topic), |b| b.tokens)
    }

    /// Whether a request with this limit is subject to egress throttling.
    pub fn should_throttle(&self, limit: u32) -> bool {
        limit > self.config.throttle_threshold
    }

    /// Drop buckets that are full and untouched for `idle`. Returns how many
    /// were removed.
    pub fn prune_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let mut b = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            if now.saturating_duration_since(b.last_refill) < idle {
                return true;
            }
            b.refill(&self.config, now);
            b.tokens < self.config.capacity as f64
        });
        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed, "pruned idle traffic buckets");
        }
        removed
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for TrafficObserver {
    fn default() -> Self {
        Self::new(TrafficConfig::default())
    }
}

//! Age-based retention for archived envelopes.
//!
//! Deletions are range deletes over the oldest key prefix, so concurrent
//! scans always see keys in ascending time order.

use std::sync::Arc;
use std::time::Duration;

use courier_core::Clock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::traits::{EnvelopeStoreExt, KvStore};

/// Retention policy for the envelope archive.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Envelopes older than this are deleted.
    pub max_age: Duration,
    /// Time between cleaner passes.
    pub interval: Duration,
    /// Keys deleted per store call.
    pub batch_size: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            interval: Duration::from_secs(60 * 60),
            batch_size: 1000,
        }
    }
}

impl RetentionConfig {
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Periodically prunes envelopes older than `max_age`.
pub struct RetentionCleaner {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
}

impl RetentionCleaner {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: RetentionConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Run one pruning pass. Returns the number of envelopes removed.
    pub async fn run_once(&self) -> Result<u64> {
        let cutoff = self
            .clock
            .now_secs()
            .saturating_sub(self.config.max_age.as_secs());
        let removed = self
            .store
            .prune_before(cutoff, self.config.batch_size)
            .await?;
        if removed > 0 {
            info!(removed, cutoff, "pruned expired envelopes");
        } else {
            debug!(cutoff, "retention pass found nothing to prune");
        }
        Ok(removed)
    }

    /// Run passes every `interval` until `shutdown` flips to `true`.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "retention pass failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("retention cleaner stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

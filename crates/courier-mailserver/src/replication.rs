//! Mailserver-to-mailserver replication.
//!
//! A replica pulls a time range from a source by issuing sync requests
//! and feeding each returned cursor into the next one until the cursor
//! comes back empty. Received envelopes land in the replica's archive
//! through an [`ArchiveSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{Envelope, PeerId};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{MailserverError, Result};
use crate::messages::SyncMailRequest;
use crate::server::Mailserver;
use crate::transport::EnvelopeSink;

/// Sink that archives every envelope it receives into a mailserver.
pub struct ArchiveSink {
    target: Arc<Mailserver>,
    archived: AtomicU64,
    skipped: AtomicU64,
}

impl ArchiveSink {
    pub fn new(target: Arc<Mailserver>) -> Self {
        Self {
            target,
            archived: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Envelopes written to the target.
    pub fn archived(&self) -> u64 {
        self.archived.load(Ordering::Relaxed)
    }

    /// Envelopes refused by the target's ingress budget.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EnvelopeSink for ArchiveSink {
    async fn send_envelopes(&self, peer: &PeerId, envelopes: Vec<Bytes>) -> Result<()> {
        for raw in envelopes {
            let envelope = Envelope::decode(&raw)?;
            if self.target.archive(&envelope).await? {
                self.archived.fetch_add(1, Ordering::Relaxed);
            } else {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(peer = %peer, archived = self.archived(), "archived replicated bundle");
        Ok(())
    }
}

/// Summary of a completed replication run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    /// Sync requests issued.
    pub pages: u32,
    /// Cursor of the last non-final page. Empty if the first page was final.
    pub last_cursor: Vec<u8>,
}

/// Pull everything `request` selects from `source` into `sink`.
///
/// `peer` identifies the replica to the source (rate limiting, logging).
/// Fails on the first page the source reports as failed.
pub async fn replicate(
    source: &Mailserver,
    peer: &PeerId,
    request: SyncMailRequest,
    sink: &dyn EnvelopeSink,
    cancel: &CancelToken,
) -> Result<ReplicationReport> {
    let mut report = ReplicationReport::default();
    let mut request = request;

    loop {
        if cancel.is_cancelled() {
            return Err(MailserverError::Cancelled);
        }

        let response = source.sync_mail(peer, &request, sink, cancel).await;
        report.pages += 1;

        if !response.is_ok() {
            warn!(peer = %peer, page = report.pages, error = %response.error, "replication page failed");
            return Err(MailserverError::Remote(response.error));
        }
        if response.cursor.is_empty() {
            break;
        }
        report.last_cursor = response.cursor.clone();
        request = request.with_cursor(response.cursor);
    }

    info!(
        peer = %peer,
        lower = request.lower,
        upper = request.upper,
        pages = report.pages,
        "replication finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MailserverConfig;
    use courier_core::{topic_to_bloom, ManualClock, Topic};
    use courier_store::MemoryStore;

    fn mailserver() -> Arc<Mailserver> {
        Arc::new(Mailserver::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(10_000)),
            MailserverConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_replicates_range_across_pages() {
        let source = mailserver();
        let replica = mailserver();
        let topic = Topic::from_u32(0xAABBCCDD);
        let other = Topic::from_u32(0x11223344);

        for ts in [100u32, 200, 300, 400, 500] {
            source.archive(&Envelope::new(ts, 60, topic, vec![1])).await.unwrap();
        }
        source.archive(&Envelope::new(250, 60, other, vec![2])).await.unwrap();
        source.archive(&Envelope::new(900, 60, topic, vec![3])).await.unwrap();

        let sink = ArchiveSink::new(replica.clone());
        let request = SyncMailRequest::new(100, 500, 2).with_bloom(topic_to_bloom(&topic));
        let report = replicate(&source, &PeerId::ZERO, request, &sink, &CancelToken::new())
            .await
            .unwrap();

        // 5 matches at 2 per page: 2, 2, 1
        assert_eq!(report.pages, 3);
        assert_eq!(sink.archived(), 5);
        assert_eq!(replica.count(0, 1_000, None).await.unwrap(), 5);
        assert_eq!(replica.count(0, 1_000, Some(other)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replication_is_idempotent() {
        let source = mailserver();
        let replica = mailserver();
        let topic = Topic::from_u32(7);
        for ts in [10u32, 20, 30] {
            source.archive(&Envelope::new(ts, 60, topic, vec![0])).await.unwrap();
        }

        let sink = ArchiveSink::new(replica.clone());
        for _ in 0..2 {
            replicate(&source, &PeerId::ZERO, SyncMailRequest::new(0, 100, 10), &sink, &CancelToken::new())
                .await
                .unwrap();
        }
        assert_eq!(replica.count(0, 100, None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_remote_failure_is_reported() {
        let source = mailserver();
        let sink = ArchiveSink::new(mailserver());

        let err = replicate(&source, &PeerId::ZERO, SyncMailRequest::new(500, 100, 10), &sink, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MailserverError::Remote(ref msg) if msg.contains("from > to")));
    }

    #[tokio::test]
    async fn test_cancelled_replication() {
        let source = mailserver();
        let sink = ArchiveSink::new(mailserver());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = replicate(&source, &PeerId::ZERO, SyncMailRequest::new(0, 100, 10), &sink, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MailserverError::Cancelled));
    }
}

//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use courier_core::{Envelope, ManualClock, PeerId, Topic};
use courier_mailserver::transport::memory::RecordingSink;
use courier_mailserver::{CancelToken, MailServerResponse, Mailserver, MailserverConfig, MessagesRequest};
use courier_store::MemoryStore;

/// The topic used throughout the scenario tests.
pub const SCENARIO_TOPIC: Topic = Topic::from_u32(0xAABBCCDD);

/// A mailserver over a memory store with a settable clock.
pub struct TestFixture {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub mailserver: Arc<Mailserver>,
}

impl TestFixture {
    /// Create a fixture whose clock reads `now` (unix seconds).
    pub fn new(now: u64) -> Self {
        Self::with_config(now, MailserverConfig::default())
    }

    pub fn with_config(now: u64, config: MailserverConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(now));
        let mailserver = Arc::new(Mailserver::new(store.clone(), clock.clone(), config));
        Self {
            store,
            clock,
            mailserver,
        }
    }

    /// Archive one envelope per `(timestamp, topic)` and return them.
    pub async fn seed(&self, entries: &[(u32, Topic)]) -> Vec<Envelope> {
        let envelopes = crate::generators::materialize(entries);
        for envelope in &envelopes {
            let stored = self
                .mailserver
                .archive(envelope)
                .await
                .unwrap_or_else(|e| panic!("archive failed: {e}"));
            assert!(stored, "ingress budget refused a fixture envelope");
        }
        envelopes
    }

    /// Follow cursors until the range is exhausted.
    pub async fn fetch_all(&self, peer: &PeerId, request: MessagesRequest) -> Pages {
        fetch_all(&self.mailserver, peer, request).await
    }
}

/// Everything a paginated fetch produced.
#[derive(Debug, Default)]
pub struct Pages {
    /// Envelopes per page, in order.
    pub pages: Vec<Vec<Envelope>>,
    pub responses: Vec<MailServerResponse>,
}

impl Pages {
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.pages.iter().flatten().cloned().collect()
    }

    pub fn timestamps(&self) -> Vec<u32> {
        self.pages.iter().flatten().map(|e| e.timestamp()).collect()
    }
}

/// Issue `request`, then re-issue it with each returned cursor until the
/// cursor comes back empty. Panics on an error response.
pub async fn fetch_all(server: &Mailserver, peer: &PeerId, request: MessagesRequest) -> Pages {
    let mut result = Pages::default();
    let mut request = request;
    let cancel = CancelToken::new();

    // a broken cursor would otherwise loop forever
    for _ in 0..10_000 {
        let sink = RecordingSink::new();
        let response = server.deliver_mail(peer, &request, &sink, &cancel).await;
        assert!(response.is_ok(), "request failed: {}", response.error);

        result.pages.push(sink.envelopes());
        let cursor = response.cursor.clone();
        result.responses.push(response);
        if cursor.is_empty() {
            return result;
        }
        request = request.with_cursor(cursor);
    }
    panic!("pagination did not terminate");
}

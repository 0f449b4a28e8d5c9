//! The mailserver: envelope archive plus the history replay protocol.
//!
//! Replay is a single ascending scan over `[DbKey(from), DbKey(to + 1))`.
//! The scan runs in pages so the cancellation token is checked regularly
//! and no store call holds the backend for long. Matching envelopes are
//! grouped into bundles no larger than `max_message_size` and pushed to
//! the caller's sink as they fill.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::{
    bloom_filter_match, bloom_from_slice, is_full_node, Bloom, Clock, DbKey, Envelope,
    EnvelopeHash, PeerId, Topic,
};
use courier_store::{decode_stored, EnvelopeStoreExt, KeyRange, KvStore, StoreError};

use crate::cancel::CancelToken;
use crate::error::{MailserverError, Result};
use crate::messages::{
    limits, validate_cursor, MailServerResponse, MessagesRequest, SyncEventResponse,
    SyncMailRequest,
};
use crate::rate_limiter::PeerRateLimiter;
use crate::traffic::{Direction, TrafficConfig, TrafficObserver};
use crate::transport::EnvelopeSink;

/// Configuration for mailserver behavior.
#[derive(Debug, Clone)]
pub struct MailserverConfig {
    /// Largest accepted `limit`; also the value used for `limit == 0`.
    pub max_limit: u32,
    /// Window used when a request leaves `from` unset.
    pub default_window_secs: u32,
    /// Longest `[from, to]` span a client may ask for. `None` disables.
    pub max_query_range: Option<Duration>,
    /// Minimum time between requests from one peer. `None` disables.
    pub rate_limit_interval: Option<Duration>,
    /// Upper bound on one bundle pushed to the sink, in bytes.
    pub max_message_size: usize,
    /// How long one bundle push may take.
    pub send_timeout: Duration,
    /// Entries fetched per store call during a scan.
    pub scan_page_size: usize,
    /// How often idle rate-limiter and traffic entries are pruned.
    pub prune_interval: Duration,
    pub traffic: TrafficConfig,
}

impl Default for MailserverConfig {
    fn default() -> Self {
        Self {
            max_limit: limits::MAX_LIMIT_IN_MESSAGES_REQUEST,
            default_window_secs: limits::DEFAULT_QUERY_WINDOW_SECS,
            max_query_range: None,
            rate_limit_interval: None,
            max_message_size: limits::DEFAULT_MAX_MESSAGE_SIZE,
            send_timeout: Duration::from_secs(10),
            scan_page_size: 100,
            prune_interval: Duration::from_secs(60),
            traffic: TrafficConfig::default(),
        }
    }
}

impl MailserverConfig {
    pub fn with_max_query_range(mut self, range: Duration) -> Self {
        self.max_query_range = Some(range);
        self
    }

    pub fn with_rate_limit_interval(mut self, interval: Duration) -> Self {
        self.rate_limit_interval = Some(interval);
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size;
        self
    }

    pub fn with_traffic(mut self, traffic: TrafficConfig) -> Self {
        self.traffic = traffic;
        self
    }
}

/// A validated, fully resolved replay query.
#[derive(Debug, Clone)]
pub struct Query {
    /// Inclusive lower bound, unix seconds.
    pub from: u32,
    /// Inclusive upper bound, unix seconds.
    pub to: u32,
    /// `None` accepts every topic.
    pub bloom: Option<Bloom>,
    pub limit: u32,
    pub cursor: Vec<u8>,
}

/// What a replay produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOutcome {
    pub envelopes: u32,
    pub bundles: u32,
    pub last_envelope_hash: EnvelopeHash,
    /// Key of the last envelope sent when the response stopped early.
    /// Empty when the range is exhausted.
    pub cursor: Vec<u8>,
}

/// Envelope archive and history server.
pub struct Mailserver {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: MailserverConfig,
    traffic: TrafficObserver,
    rate_limiter: Option<PeerRateLimiter>,
}

impl Mailserver {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: MailserverConfig) -> Self {
        let traffic = TrafficObserver::new(config.traffic.clone());
        let rate_limiter = config.rate_limit_interval.map(PeerRateLimiter::new);
        Self {
            store,
            clock,
            config,
            traffic,
            rate_limiter,
        }
    }

    pub fn config(&self) -> &MailserverConfig {
        &self.config
    }

    pub fn traffic(&self) -> &TrafficObserver {
        &self.traffic
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ingest
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist an envelope. Returns `false` when the topic's ingress budget
    /// is drained and the envelope was not stored.
    pub async fn archive(&self, envelope: &Envelope) -> Result<bool> {
        let raw_len = envelope.encode().len() as u64;
        if !self
            .traffic
            .try_observe(Direction::Ingress, &envelope.topic, raw_len)
        {
            warn!(topic = %envelope.topic, "ingress budget drained, not archiving envelope");
            return Ok(false);
        }

        let key = self.store.save_envelope(envelope).await?;
        debug!(hash = %key.envelope_hash(), timestamp = key.timestamp(), "archived envelope");
        Ok(true)
    }

    /// Count archived envelopes with `start <= timestamp < end`.
    pub async fn count(&self, start: u64, end: u64, topic: Option<Topic>) -> Result<u64> {
        Ok(self.store.count_envelopes(start, end, topic).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replay Protocol
    // ─────────────────────────────────────────────────────────────────────────

    /// Serve a client history request. Errors are reported in the response.
    pub async fn deliver_mail(
        &self,
        peer: &PeerId,
        request: &MessagesRequest,
        sink: &dyn EnvelopeSink,
        cancel: &CancelToken,
    ) -> MailServerResponse {
        let request_id = request.id.to_string();
        info!(peer = %peer, request_id = %request_id, "delivering mail");

        let result = self
            .serve_messages(peer, request, sink, cancel, &request_id)
            .await;

        match result {
            Ok(outcome) => {
                info!(
                    peer = %peer,
                    request_id = %request_id,
                    envelopes = outcome.envelopes,
                    last = %outcome.last_envelope_hash,
                    more = !outcome.cursor.is_empty(),
                    "sending historic message response"
                );
                MailServerResponse::success(request.id, outcome.last_envelope_hash, outcome.cursor)
            }
            Err(e) => {
                log_failure(peer, &request_id, &e);
                MailServerResponse::failure(request.id, &e)
            }
        }
    }

    /// Serve a replication request from another mailserver.
    pub async fn sync_mail(
        &self,
        peer: &PeerId,
        request: &SyncMailRequest,
        sink: &dyn EnvelopeSink,
        cancel: &CancelToken,
    ) -> SyncEventResponse {
        let request_id = format!("sync-{}-{}", peer, self.clock.now_secs());
        info!(peer = %peer, request_id = %request_id, "started syncing envelopes");

        let result = self
            .serve_sync(peer, request, sink, cancel, &request_id)
            .await;

        match result {
            Ok(outcome) => {
                info!(
                    peer = %peer,
                    request_id = %request_id,
                    envelopes = outcome.envelopes,
                    "finished syncing envelopes"
                );
                SyncEventResponse::success(outcome.cursor)
            }
            Err(e) => {
                log_failure(peer, &request_id, &e);
                SyncEventResponse::failure(&e)
            }
        }
    }

    async fn serve_messages(
        &self,
        peer: &PeerId,
        request: &MessagesRequest,
        sink: &dyn EnvelopeSink,
        cancel: &CancelToken,
        request_id: &str,
    ) -> Result<QueryOutcome> {
        self.admit(peer)?;
        let query = self.resolve_messages_request(request)?;
        info!(
            peer = %peer,
            request_id = %request_id,
            from = query.from,
            to = query.to,
            limit = query.limit,
            has_cursor = !query.cursor.is_empty(),
            "processing request"
        );
        self.query(peer, &query, sink, cancel, request_id).await
    }

    async fn serve_sync(
        &self,
        peer: &PeerId,
        request: &SyncMailRequest,
        sink: &dyn EnvelopeSink,
        cancel: &CancelToken,
        request_id: &str,
    ) -> Result<QueryOutcome> {
        self.admit(peer)?;
        request.validate()?;
        let query = Query {
            from: request.lower,
            to: request.upper,
            bloom: effective_bloom(&request.bloom)?,
            limit: request.limit,
            cursor: request.cursor.clone(),
        };
        self.query(peer, &query, sink, cancel, request_id).await
    }

    fn admit(&self, peer: &PeerId) -> Result<()> {
        match &self.rate_limiter {
            Some(limiter) if !limiter.check(peer) => Err(MailserverError::RateLimited),
            _ => Ok(()),
        }
    }

    /// Apply defaults and validate a client request.
    pub fn resolve_messages_request(&self, request: &MessagesRequest) -> Result<Query> {
        let limit = match request.limit {
            0 => self.config.max_limit,
            n if n > self.config.max_limit => {
                return Err(MailserverError::LimitExceeded {
                    limit: n,
                    max: self.config.max_limit,
                })
            }
            n => n,
        };

        let to = match request.to {
            0 => u32::try_from(self.clock.now_secs()).unwrap_or(u32::MAX),
            t => t,
        };
        let from = match request.from {
            0 => to.saturating_sub(self.config.default_window_secs),
            f => f,
        };
        if from > to {
            return Err(MailserverError::InvalidTimeRange { from, to });
        }

        if let Some(max) = self.config.max_query_range {
            let range = u64::from(to - from);
            if range > max.as_secs() {
                return Err(MailserverError::QueryRangeTooLarge {
                    range,
                    max: max.as_secs(),
                });
            }
        }

        validate_cursor(&request.cursor)?;

        Ok(Query {
            from,
            to,
            bloom: effective_bloom(&request.bloom)?,
            limit,
            cursor: request.cursor.clone(),
        })
    }

    /// Run a resolved query, pushing matches to `sink`.
    pub async fn query(
        &self,
        peer: &PeerId,
        query: &Query,
        sink: &dyn EnvelopeSink,
        cancel: &CancelToken,
        request_id: &str,
    ) -> Result<QueryOutcome> {
        validate_cursor(&query.cursor)?;
        let range = KeyRange::new(
            DbKey::boundary(u64::from(query.from)).to_bytes().to_vec(),
            DbKey::boundary(u64::from(query.to) + 1).to_bytes().to_vec(),
        );

        let mut scan_start = range.start.clone();
        if !query.cursor.is_empty() {
            if range.contains(&query.cursor) {
                scan_start = DbKey::cursor_successor(&query.cursor);
            } else {
                warn!(
                    peer = %peer,
                    request_id = %request_id,
                    "stale cursor outside requested range, restarting from lower bound"
                );
            }
        }

        let throttle = self.traffic.should_throttle(query.limit);
        let page_size = self.config.scan_page_size.max(1);
        let mut outcome = QueryOutcome::default();
        let mut last_key: Vec<u8> = Vec::new();
        let mut bundle: Vec<Bytes> = Vec::new();
        let mut bundle_size = 0usize;

        'scan: loop {
            if cancel.is_cancelled() {
                return Err(MailserverError::Cancelled);
            }

            let page_range = KeyRange::new(scan_start.clone(), range.end.clone());
            let page = self.store.scan(&page_range, page_size).await?;
            let page_len = page.len();

            for entry in page {
                scan_start = DbKey::cursor_successor(&entry.key);

                let envelope = decode_stored(&entry.key, &entry.value).map_err(|e| {
                    error!(peer = %peer, request_id = %request_id, error = %e, "corrupt envelope in archive");
                    e
                })?;

                if let Some(filter) = &query.bloom {
                    if !bloom_filter_match(filter, &envelope.bloom()) {
                        continue;
                    }
                }

                let size = entry.value.len();
                if throttle {
                    if !self
                        .traffic
                        .try_observe(Direction::Egress, &envelope.topic, size as u64)
                    {
                        if outcome.envelopes == 0 {
                            return Err(MailserverError::Throttled(envelope.topic));
                        }
                        warn!(
                            peer = %peer,
                            request_id = %request_id,
                            topic = %envelope.topic,
                            sent = outcome.envelopes,
                            "egress budget drained, answering short"
                        );
                        outcome.cursor = last_key.clone();
                        break 'scan;
                    }
                } else {
                    self.traffic
                        .observe(Direction::Egress, &envelope.topic, size as u64);
                }

                let key = DbKey::from_bytes(&entry.key).map_err(StoreError::from)?;

                if !bundle.is_empty() && bundle_size + size > self.config.max_message_size {
                    self.push_bundle(peer, sink, std::mem::take(&mut bundle), cancel)
                        .await?;
                    outcome.bundles += 1;
                    bundle_size = 0;
                }
                bundle.push(entry.value);
                bundle_size += size;

                outcome.envelopes += 1;
                outcome.last_envelope_hash = key.envelope_hash();
                last_key = entry.key;

                if outcome.envelopes >= query.limit {
                    outcome.cursor = last_key.clone();
                    break 'scan;
                }
            }

            if page_len < page_size {
                break;
            }
        }

        if !bundle.is_empty() {
            self.push_bundle(peer, sink, bundle, cancel).await?;
            outcome.bundles += 1;
        }

        Ok(outcome)
    }

    async fn push_bundle(
        &self,
        peer: &PeerId,
        sink: &dyn EnvelopeSink,
        bundle: Vec<Bytes>,
        cancel: &CancelToken,
    ) -> Result<()> {
        tokio::select! {
            sent = tokio::time::timeout(self.config.send_timeout, sink.send_envelopes(peer, bundle)) => {
                sent.map_err(|_| MailserverError::SendTimeout)?
            }
            _ = cancel.cancelled() => Err(MailserverError::Cancelled),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Prune idle rate-limiter and traffic entries once.
    pub fn prune(&self) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.prune();
        }
        self.traffic.prune_idle(self.config.prune_interval);
    }

    /// Prune every `prune_interval` until `shutdown` flips to `true`.
    pub fn spawn_maintenance(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(server.config.prune_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => server.prune(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("mailserver maintenance stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Parse a wire bloom. Empty or full filters skip matching entirely.
fn effective_bloom(bytes: &[u8]) -> Result<Option<Bloom>> {
    Ok(bloom_from_slice(bytes)?.filter(|b| !is_full_node(b)))
}

fn log_failure(peer: &PeerId, request_id: &str, e: &MailserverError) {
    if e.is_client_error() {
        info!(peer = %peer, request_id = %request_id, error = %e, "request failed validation");
    } else if e.is_transient() {
        warn!(peer = %peer, request_id = %request_id, error = %e, "request deferred");
    } else {
        error!(peer = %peer, request_id = %request_id, error = %e, "request failed");
    }
}

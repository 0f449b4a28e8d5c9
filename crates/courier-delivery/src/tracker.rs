//! Envelope delivery tracker.
//!
//! Follows locally posted envelopes from the moment they are handed to the
//! transport until they are confirmed, expire or are rejected. Transport
//! events arrive unordered and possibly duplicated; the tracker turns them
//! into one authoritative state per envelope hash.
//!
//! ## State machine
//!
//! ```text
//!              add()
//!                │
//!                ▼
//!          ┌──────────┐  Sent (no batch)
//!          │  Posted  │  BatchAcknowledged (trusted)  ┌──────┐
//!          │          │──────────────────────────────▶│ Sent │
//!          └──────────┘  Received (trusted)           └──────┘
//!                │
//!                │ Expired / rejected in batch
//!                ▼
//!          removed (retried if attempts remain)
//! ```
//!
//! All state sits behind one mutex that is never held across an await.
//! Handler callbacks and confirmation waiters run after it is released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use courier_core::{BatchHash, EnvelopeHash, MessageId, NewMessage, PeerId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, Result};
use crate::events::{EnvelopeError, EnvelopeEvent};
use crate::handler::{DeliveryHandler, EnvelopePoster};
use crate::trust::{MailserverRegistry, TrustPolicy};

/// Delivery state of a tracked envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeState {
    /// The hash is unknown to the tracker.
    NotTracked,
    /// Handed to the transport, not yet confirmed.
    Posted,
    /// Confirmed by the transport or a trusted peer.
    Sent,
}

/// Configuration for the tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Total posts allowed per message, including the first.
    pub max_attempts: u32,
    /// Only honor acknowledgements from mailservers.
    pub mailserver_confirmations: bool,
    /// How long a batch or an early acknowledgement waits for its partner.
    pub batch_timeout: Duration,
    /// How often the dispatcher checks the retry queue.
    pub retry_interval: Duration,
    /// Backoff before the first retry; doubles per attempt.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            mailserver_confirmations: false,
            batch_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_millis(500),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl TrackerConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_mailserver_confirmations(mut self, enabled: bool) -> Self {
        self.mailserver_confirmations = enabled;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Delay before retrying an envelope that has been posted `attempts`
    /// times: `base * 2^attempts`, capped at `max_backoff`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

#[derive(Debug)]
struct TrackedEnvelope {
    state: EnvelopeState,
    attempts: u32,
    message: NewMessage,
    message_ids: Vec<MessageId>,
}

#[derive(Debug)]
struct PendingBatch {
    envelopes: HashSet<EnvelopeHash>,
    created: Instant,
}

/// An acknowledgement that may precede some of its batch's `Sent` events.
#[derive(Debug)]
struct BatchAck {
    errors: Vec<EnvelopeError>,
    received: Instant,
}

#[derive(Debug)]
struct RetryEntry {
    previous_hash: EnvelopeHash,
    message: NewMessage,
    message_ids: Vec<MessageId>,
    attempts: u32,
    failed_at: Instant,
}

type Waiter = oneshot::Sender<Result<()>>;

#[derive(Debug, Default)]
struct TrackerState {
    envelopes: HashMap<EnvelopeHash, TrackedEnvelope>,
    batches: HashMap<BatchHash, PendingBatch>,
    acks: HashMap<BatchHash, BatchAck>,
    messages: HashMap<MessageId, Vec<EnvelopeHash>>,
    retry_queue: Vec<RetryEntry>,
    waiters: HashMap<EnvelopeHash, Vec<Waiter>>,
}

/// Side effects collected under the lock and run after it is released.
#[derive(Default)]
struct Effects {
    sent: Vec<MessageId>,
    expired: Vec<(Vec<MessageId>, DeliveryError)>,
    resolved: Vec<(Waiter, Result<()>)>,
}

impl Effects {
    fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.expired.is_empty() && self.resolved.is_empty()
    }
}

/// Tracks delivery of locally posted envelopes.
pub struct EnvelopeTracker {
    config: TrackerConfig,
    trust: TrustPolicy,
    handler: Option<Arc<dyn DeliveryHandler>>,
    poster: Option<Arc<dyn EnvelopePoster>>,
    state: Mutex<TrackerState>,
}

impl EnvelopeTracker {
    /// Build a tracker. With `mailserver_confirmations` set in `config`,
    /// only peers `registry` names as mailservers can confirm envelopes.
    pub fn new(config: TrackerConfig, registry: Arc<dyn MailserverRegistry>) -> Self {
        let trust = TrustPolicy::new(config.mailserver_confirmations, registry);
        Self {
            config,
            trust,
            handler: None,
            poster: None,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn DeliveryHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Enable retries through `poster`.
    pub fn with_poster(mut self, poster: Arc<dyn EnvelopePoster>) -> Self {
        self.poster = Some(poster);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Application API
    // ─────────────────────────────────────────────────────────────────────────

    /// Start tracking `hash`, posted for `message_ids`.
    ///
    /// A message may be split across several envelopes; call `add` for each
    /// with the same ids. A hash already tracked is left as it is.
    pub fn add(&self, message_ids: &[MessageId], hash: EnvelopeHash, message: NewMessage) {
        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            state.envelopes.entry(hash).or_insert_with(|| TrackedEnvelope {
                state: EnvelopeState::Posted,
                attempts: 1,
                message,
                message_ids: message_ids.to_vec(),
            });
            for id in message_ids {
                let hashes = state.messages.entry(*id).or_default();
                if !hashes.contains(&hash) {
                    hashes.push(hash);
                }
            }
            debug!(hash = %hash, messages = message_ids.len(), "tracking envelope");
            Self::process_message_ids(&mut state, message_ids, &mut effects);
        }
        self.apply(effects);
    }

    /// Track every envelope backing `message_ids` at once.
    pub fn add_all(
        &self,
        message_ids: &[MessageId],
        envelopes: impl IntoIterator<Item = (EnvelopeHash, NewMessage)>,
    ) {
        for (hash, message) in envelopes {
            self.add(message_ids, hash, message);
        }
    }

    pub fn get_state(&self, hash: &EnvelopeHash) -> EnvelopeState {
        self.lock()
            .envelopes
            .get(hash)
            .map_or(EnvelopeState::NotTracked, |e| e.state)
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().envelopes.len()
    }

    /// Remove a confirmed envelope. Returns `false` if `hash` is not
    /// tracked or not yet confirmed.
    pub fn take_confirmed(&self, hash: &EnvelopeHash) -> bool {
        let mut state = self.lock();
        match state.envelopes.get(hash) {
            Some(e) if e.state == EnvelopeState::Sent => {
                Self::remove_envelope(&mut state, hash);
                true
            }
            _ => false,
        }
    }

    /// Wait until `hash` is confirmed, fails, or `timeout` passes.
    pub async fn wait_for_confirmation(&self, hash: &EnvelopeHash, timeout: Duration) -> Result<()> {
        let rx = {
            let mut state = self.lock();
            match state.envelopes.get(hash).map(|e| e.state) {
                None | Some(EnvelopeState::NotTracked) => {
                    return Err(DeliveryError::NotTracked(*hash))
                }
                Some(EnvelopeState::Sent) => return Ok(()),
                Some(EnvelopeState::Posted) => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.entry(*hash).or_default().push(tx);
                    rx
                }
            }
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // the envelope left tracking without a verdict
            Ok(Err(_)) => Err(DeliveryError::NotTracked(*hash)),
            Err(_) => Err(DeliveryError::Timeout(*hash)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event Ingestion
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply one transport event. Events for untracked hashes are ignored.
    pub fn handle_event(&self, event: EnvelopeEvent) {
        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            match event {
                EnvelopeEvent::Sent { hash, batch, peer } => {
                    self.on_sent(&mut state, hash, batch, &peer, &mut effects)
                }
                EnvelopeEvent::Expired { hash } => Self::on_failure(
                    &self.config,
                    self.poster.is_some(),
                    &mut state,
                    &hash,
                    DeliveryError::Expired(hash),
                    &mut effects,
                ),
                EnvelopeEvent::Received { hash, peer } => {
                    self.on_received(&mut state, hash, &peer, &mut effects)
                }
                EnvelopeEvent::BatchAcknowledged {
                    batch,
                    peer,
                    errors,
                } => self.on_batch_acknowledged(&mut state, batch, &peer, errors, &mut effects),
            }
        }
        self.apply(effects);
    }

    fn on_sent(
        &self,
        state: &mut TrackerState,
        hash: EnvelopeHash,
        batch: Option<BatchHash>,
        peer: &PeerId,
        effects: &mut Effects,
    ) {
        match state.envelopes.get(&hash).map(|e| e.state) {
            Some(EnvelopeState::Posted) => {}
            Some(_) => return,
            None => {
                debug!(hash = %hash, "sent event for untracked envelope");
                return;
            }
        }
        debug!(hash = %hash, peer = %peer, "envelope is sent");

        let Some(batch) = batch else {
            Self::mark_sent(state, &hash, effects);
            return;
        };

        // the acknowledgement may already be here
        let rejection = state.acks.get(&batch).map(|ack| {
            ack.errors
                .iter()
                .find(|e| e.hash == hash)
                .map(|e| e.reason())
        });
        match rejection {
            Some(None) => {
                debug!(hash = %hash, batch = %batch, "batch already acknowledged");
                Self::mark_sent(state, &hash, effects);
            }
            Some(Some(reason)) => {
                let error = DeliveryError::Rejected { hash, reason };
                Self::on_failure(&self.config, self.poster.is_some(), state, &hash, error, effects);
            }
            None => {
                debug!(hash = %hash, batch = %batch, "waiting for a confirmation");
                state
                    .batches
                    .entry(batch)
                    .or_insert_with(|| PendingBatch {
                        envelopes: HashSet::new(),
                        created: Instant::now(),
                    })
                    .envelopes
                    .insert(hash);
            }
        }
    }

    fn on_received(
        &self,
        state: &mut TrackerState,
        hash: EnvelopeHash,
        peer: &PeerId,
        effects: &mut Effects,
    ) {
        if !self.trust.is_trusted(peer) {
            debug!(hash = %hash, peer = %peer, "ignoring receipt from untrusted peer");
            return;
        }
        if state.envelopes.get(&hash).map(|e| e.state) != Some(EnvelopeState::Posted) {
            return;
        }
        debug!(hash = %hash, peer = %peer, "expected envelope received");
        Self::mark_sent(state, &hash, effects);
    }

    fn on_batch_acknowledged(
        &self,
        state: &mut TrackerState,
        batch: BatchHash,
        peer: &PeerId,
        errors: Vec<EnvelopeError>,
        effects: &mut Effects,
    ) {
        if !self.trust.is_trusted(peer) {
            debug!(batch = %batch, peer = %peer, "ignoring acknowledgement from untrusted peer");
            return;
        }
        debug!(batch = %batch, peer = %peer, "received a confirmation");

        let mut failed = HashSet::new();
        for error in &errors {
            failed.insert(error.hash);
            if state.envelopes.contains_key(&error.hash) {
                warn!(
                    hash = %error.hash,
                    peer = %peer,
                    error = %error.description,
                    "envelope that was posted by us is discarded"
                );
                let reason = DeliveryError::Rejected {
                    hash: error.hash,
                    reason: error.reason(),
                };
                Self::on_failure(
                    &self.config,
                    self.poster.is_some(),
                    state,
                    &error.hash,
                    reason,
                    effects,
                );
            }
        }

        match state.batches.remove(&batch) {
            Some(pending) => {
                for hash in pending.envelopes.difference(&failed) {
                    if state.envelopes.get(hash).map(|e| e.state) == Some(EnvelopeState::Posted) {
                        Self::mark_sent(state, hash, effects);
                    }
                }
            }
            None => debug!(batch = %batch, "batch is not found, remembering acknowledgement"),
        }

        // later `Sent` events for this batch resolve against it
        state.acks.insert(
            batch,
            BatchAck {
                errors,
                received: Instant::now(),
            },
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    fn mark_sent(state: &mut TrackerState, hash: &EnvelopeHash, effects: &mut Effects) {
        let Some(envelope) = state.envelopes.get_mut(hash) else {
            return;
        };
        envelope.state = EnvelopeState::Sent;
        let message_ids = envelope.message_ids.clone();

        for waiter in state.waiters.remove(hash).unwrap_or_default() {
            effects.resolved.push((waiter, Ok(())));
        }
        Self::process_message_ids(state, &message_ids, effects);
    }

    /// Common path for expired and rejected envelopes.
    fn on_failure(
        config: &TrackerConfig,
        can_retry: bool,
        state: &mut TrackerState,
        hash: &EnvelopeHash,
        error: DeliveryError,
        effects: &mut Effects,
    ) {
        let Some(envelope) = state.envelopes.remove(hash) else {
            return;
        };
        for waiter in state.waiters.remove(hash).unwrap_or_default() {
            effects.resolved.push((waiter, Err(error.clone())));
        }
        if envelope.state == EnvelopeState::Sent {
            Self::forget_hash(state, &envelope.message_ids, hash);
            return;
        }

        if can_retry && envelope.attempts < config.max_attempts {
            debug!(hash = %hash, attempts = envelope.attempts, "queueing envelope for retry");
            state.retry_queue.push(RetryEntry {
                previous_hash: *hash,
                message: envelope.message,
                message_ids: envelope.message_ids,
                attempts: envelope.attempts,
                failed_at: Instant::now(),
            });
        } else {
            info!(hash = %hash, error = %error, "envelope expired");
            for id in &envelope.message_ids {
                state.messages.remove(id);
            }
            effects.expired.push((envelope.message_ids, error));
        }
    }

    /// Collect messages whose every envelope is now sent.
    fn process_message_ids(state: &mut TrackerState, message_ids: &[MessageId], effects: &mut Effects) {
        for id in message_ids {
            let Some(hashes) = state.messages.get(id) else {
                continue;
            };
            let all_sent = hashes.iter().all(|h| {
                state.envelopes.get(h).map(|e| e.state) == Some(EnvelopeState::Sent)
            });
            if all_sent {
                state.messages.remove(id);
                effects.sent.push(*id);
            }
        }
    }

    fn remove_envelope(state: &mut TrackerState, hash: &EnvelopeHash) {
        if let Some(envelope) = state.envelopes.remove(hash) {
            Self::forget_hash(state, &envelope.message_ids, hash);
        }
        state.waiters.remove(hash);
    }

    fn forget_hash(state: &mut TrackerState, message_ids: &[MessageId], hash: &EnvelopeHash) {
        for id in message_ids {
            if let Some(hashes) = state.messages.get_mut(id) {
                hashes.retain(|h| h != hash);
                if hashes.is_empty() {
                    state.messages.remove(id);
                }
            }
        }
    }

    fn apply(&self, effects: Effects) {
        if effects.is_empty() {
            return;
        }
        for (waiter, outcome) in effects.resolved {
            // the waiter may have timed out already
            let _ = waiter.send(outcome);
        }
        if let Some(handler) = &self.handler {
            if !effects.sent.is_empty() {
                handler.envelope_sent(&effects.sent);
            }
            for (ids, error) in &effects.expired {
                handler.envelope_expired(ids, error);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Retry & Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Number of envelopes waiting to be reposted.
    pub fn pending_retries(&self) -> usize {
        self.lock().retry_queue.len()
    }

    /// Repost every queued envelope whose backoff has elapsed. Returns how
    /// many were reposted.
    pub async fn retry_once(&self) -> usize {
        let Some(poster) = &self.poster else {
            return 0;
        };

        let due: Vec<RetryEntry> = {
            let mut state = self.lock();
            let now = Instant::now();
            let (due, waiting): (Vec<RetryEntry>, Vec<RetryEntry>) =
                std::mem::take(&mut state.retry_queue)
                .into_iter()
                .partition(|entry| {
                    now.saturating_duration_since(entry.failed_at)
                        >= self.config.backoff(entry.attempts)
                });
            state.retry_queue = waiting;
            due
        };

        let mut reposted = 0;
        for entry in due {
            debug!(
                hash = %entry.previous_hash,
                attempt = entry.attempts + 1,
                "retrying to send a message"
            );
            let result = poster.post(&entry.message).await;

            let mut effects = Effects::default();
            {
                let mut state = self.lock();
                match result {
                    Ok(new_hash) => {
                        reposted += 1;
                        for id in &entry.message_ids {
                            if let Some(hashes) = state.messages.get_mut(id) {
                                for h in hashes.iter_mut().filter(|h| **h == entry.previous_hash) {
                                    *h = new_hash;
                                }
                            }
                        }
                        state.envelopes.insert(
                            new_hash,
                            TrackedEnvelope {
                                state: EnvelopeState::Posted,
                                attempts: entry.attempts + 1,
                                message: entry.message,
                                message_ids: entry.message_ids,
                            },
                        );
                    }
                    Err(e) => {
                        warn!(
                            hash = %entry.previous_hash,
                            attempt = entry.attempts + 1,
                            error = %e,
                            "failed to retry sending message"
                        );
                        let attempts = entry.attempts + 1;
                        if attempts < self.config.max_attempts {
                            state.retry_queue.push(RetryEntry {
                                attempts,
                                failed_at: Instant::now(),
                                ..entry
                            });
                        } else {
                            for id in &entry.message_ids {
                                state.messages.remove(id);
                            }
                            effects.expired.push((entry.message_ids, e));
                        }
                    }
                }
            }
            self.apply(effects);
        }
        reposted
    }

    /// Drop batches and acknowledgements older than `batch_timeout`, and
    /// waiters whose caller has gone. Returns how many batch entries were
    /// removed.
    pub fn prune_stale(&self) -> usize {
        let timeout = self.config.batch_timeout;
        let now = Instant::now();
        let mut state = self.lock();

        let before = state.batches.len() + state.acks.len();
        state
            .batches
            .retain(|_, b| now.saturating_duration_since(b.created) < timeout);
        state
            .acks
            .retain(|_, a| now.saturating_duration_since(a.received) < timeout);
        let removed = before - state.batches.len() - state.acks.len();

        state.waiters.retain(|_, waiters| {
            waiters.retain(|w| !w.is_closed());
            !waiters.is_empty()
        });

        if removed > 0 {
            debug!(removed, "expired unresolved batches");
        }
        removed
    }

    /// Consume `events` in arrival order until the channel closes or
    /// `shutdown` flips to `true`. Also drives retries and pruning.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<EnvelopeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.config.retry_interval);
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => {
                            debug!(kind = event.kind(), "envelope event");
                            tracker.handle_event(event);
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        tracker.retry_once().await;
                        tracker.prune_stale();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("envelope tracker dispatcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EnvelopeErrorCode;
    use crate::handler::memory::{RecordingHandler, SealingPoster};
    use crate::trust::StaticMailservers;
    use courier_core::{ManualClock, Topic};

    fn msg() -> NewMessage {
        NewMessage::new(Topic::from_u32(0xAABBCCDD), 60, vec![1, 2, 3])
    }

    fn hash(n: u8) -> EnvelopeHash {
        EnvelopeHash::from_bytes([n; 32])
    }

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn no_mailservers() -> Arc<StaticMailservers> {
        Arc::new(StaticMailservers::default())
    }

    fn tracker() -> EnvelopeTracker {
        EnvelopeTracker::new(TrackerConfig::default(), no_mailservers())
    }

    /// Tracker honoring only peer 1 as a mailserver.
    fn strict_tracker() -> EnvelopeTracker {
        let registry = Arc::new(StaticMailservers::new([peer(1)]));
        EnvelopeTracker::new(
            TrackerConfig::default().with_mailserver_confirmations(true),
            registry,
        )
    }

    #[test]
    fn test_add_and_direct_sent() {
        let t = tracker();
        t.add(&[], hash(1), msg());
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Posted);

        t.handle_event(EnvelopeEvent::sent(hash(1), peer(9)));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Sent);
    }

    #[test]
    fn test_events_for_untracked_hash_are_noops() {
        let t = tracker();
        let events = vec![
            EnvelopeEvent::sent(hash(5), peer(1)),
            EnvelopeEvent::Expired { hash: hash(5) },
            EnvelopeEvent::Received {
                hash: hash(5),
                peer: peer(1),
            },
            EnvelopeEvent::acknowledged(hash(6), peer(1)),
        ];
        for event in events {
            t.handle_event(event);
            assert_eq!(t.get_state(&hash(5)), EnvelopeState::NotTracked);
        }
        assert_eq!(t.tracked_count(), 0);
    }

    #[test]
    fn test_expiry_is_terminal() {
        let t = tracker();
        t.add(&[], hash(1), msg());
        t.handle_event(EnvelopeEvent::Expired { hash: hash(1) });
        t.handle_event(EnvelopeEvent::sent(hash(1), peer(1)));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::NotTracked);
    }

    #[test]
    fn test_batch_acknowledgement() {
        let t = tracker();
        t.add(&[], hash(1), msg());
        t.add(&[], hash(2), msg());

        t.handle_event(EnvelopeEvent::sent_in_batch(hash(1), hash(100), peer(1)));
        t.handle_event(EnvelopeEvent::sent_in_batch(hash(2), hash(100), peer(1)));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Posted);

        t.handle_event(EnvelopeEvent::acknowledged(hash(100), peer(1)));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Sent);
        assert_eq!(t.get_state(&hash(2)), EnvelopeState::Sent);
    }

    #[test]
    fn test_untrusted_confirmations_are_dropped() {
        let t = strict_tracker();
        t.add(&[], hash(1), msg());
        t.handle_event(EnvelopeEvent::sent_in_batch(hash(1), hash(100), peer(2)));

        t.handle_event(EnvelopeEvent::acknowledged(hash(100), peer(2)));
        t.handle_event(EnvelopeEvent::Received {
            hash: hash(1),
            peer: peer(2),
        });
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Posted);

        t.handle_event(EnvelopeEvent::acknowledged(hash(100), peer(1)));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Sent);
    }

    #[test]
    fn test_config_flag_gates_acknowledgements() {
        let t = EnvelopeTracker::new(
            TrackerConfig::default().with_mailserver_confirmations(true),
            no_mailservers(),
        );
        t.add(&[], hash(1), msg());
        t.handle_event(EnvelopeEvent::sent_in_batch(hash(1), hash(100), peer(7)));
        t.handle_event(EnvelopeEvent::acknowledged(hash(100), peer(7)));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Posted);
    }

    #[test]
    fn test_flag_off_ignores_registry() {
        let registry = Arc::new(StaticMailservers::new([peer(1)]));
        let t = EnvelopeTracker::new(TrackerConfig::default(), registry);
        t.add(&[], hash(1), msg());
        t.handle_event(EnvelopeEvent::sent_in_batch(hash(1), hash(100), peer(7)));
        t.handle_event(EnvelopeEvent::acknowledged(hash(100), peer(7)));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Sent);
    }

    #[test]
    fn test_received_from_mailserver_confirms() {
        let t = strict_tracker();
        t.add(&[], hash(1), msg());
        t.handle_event(EnvelopeEvent::Received {
            hash: hash(1),
            peer: peer(1),
        });
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Sent);
    }

    #[test]
    fn test_early_acknowledgement_is_applied() {
        let t = tracker();
        t.add(&[], hash(1), msg());
        t.handle_event(EnvelopeEvent::acknowledged(hash(100), peer(1)));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Posted);

        t.handle_event(EnvelopeEvent::sent_in_batch(hash(1), hash(100), peer(1)));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Sent);
    }

    #[test]
    fn test_duplicate_confirmation_is_noop() {
        let handler = Arc::new(RecordingHandler::new());
        let t = tracker().with_handler(handler.clone());
        let id = MessageId::from_bytes([7; 32]);
        t.add(&[id], hash(1), msg());

        t.handle_event(EnvelopeEvent::sent_in_batch(hash(1), hash(100), peer(1)));
        t.handle_event(EnvelopeEvent::sent(hash(1), peer(1)));
        t.handle_event(EnvelopeEvent::acknowledged(hash(100), peer(1)));
        t.handle_event(EnvelopeEvent::Received {
            hash: hash(1),
            peer: peer(1),
        });

        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Sent);
        assert_eq!(handler.sent(), vec![id]);
    }

    #[test]
    fn test_rejected_envelope_in_batch() {
        let handler = Arc::new(RecordingHandler::new());
        let t = tracker().with_handler(handler.clone());
        let (a, b) = (MessageId::from_bytes([1; 32]), MessageId::from_bytes([2; 32]));
        t.add(&[a], hash(1), msg());
        t.add(&[b], hash(2), msg());
        t.handle_event(EnvelopeEvent::sent_in_batch(hash(1), hash(100), peer(1)));
        t.handle_event(EnvelopeEvent::sent_in_batch(hash(2), hash(100), peer(1)));

        t.handle_event(EnvelopeEvent::BatchAcknowledged {
            batch: hash(100),
            peer: peer(1),
            errors: vec![EnvelopeError::new(hash(2), EnvelopeErrorCode::TimeNotSynced, "")],
        });

        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Sent);
        assert_eq!(t.get_state(&hash(2)), EnvelopeState::NotTracked);
        assert_eq!(handler.sent(), vec![a]);
        let expired = handler.expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, b);
        assert!(matches!(
            &expired[0].1,
            DeliveryError::Rejected { reason, .. } if reason.contains("time sync")
        ));
    }

    #[test]
    fn test_message_sent_once_all_envelopes_sent() {
        let handler = Arc::new(RecordingHandler::new());
        let t = tracker().with_handler(handler.clone());
        let id = MessageId::from_bytes([3; 32]);
        t.add_all(&[id], [(hash(1), msg()), (hash(2), msg())]);

        t.handle_event(EnvelopeEvent::sent(hash(1), peer(1)));
        assert!(handler.sent().is_empty());
        t.handle_event(EnvelopeEvent::sent(hash(2), peer(1)));
        assert_eq!(handler.sent(), vec![id]);
    }

    #[test]
    fn test_expired_without_poster_notifies_handler() {
        let handler = Arc::new(RecordingHandler::new());
        let t = tracker().with_handler(handler.clone());
        let id = MessageId::from_bytes([4; 32]);
        t.add(&[id], hash(1), msg());

        t.handle_event(EnvelopeEvent::Expired { hash: hash(1) });
        assert_eq!(handler.expired(), vec![(id, DeliveryError::Expired(hash(1)))]);
        assert_eq!(t.pending_retries(), 0);
    }

    #[test]
    fn test_take_confirmed() {
        let t = tracker();
        t.add(&[], hash(1), msg());
        assert!(!t.take_confirmed(&hash(1)));

        t.handle_event(EnvelopeEvent::sent(hash(1), peer(1)));
        assert!(t.take_confirmed(&hash(1)));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::NotTracked);
        assert!(!t.take_confirmed(&hash(1)));
    }

    #[test]
    fn test_backoff() {
        let config = TrackerConfig::default();
        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(16));
        assert_eq!(config.backoff(5), Duration::from_secs(30));
        assert_eq!(config.backoff(64), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_envelope_is_retried() {
        let handler = Arc::new(RecordingHandler::new());
        let poster = Arc::new(SealingPoster::new(Arc::new(ManualClock::new(1_000))));
        let t = EnvelopeTracker::new(
            TrackerConfig::default().with_max_attempts(2),
            no_mailservers(),
        )
        .with_handler(handler.clone())
        .with_poster(poster.clone());
        let id = MessageId::from_bytes([5; 32]);
        t.add(&[id], hash(1), msg());

        t.handle_event(EnvelopeEvent::Expired { hash: hash(1) });
        assert_eq!(t.pending_retries(), 1);
        assert!(handler.expired().is_empty());

        // backoff after one attempt is 2s
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(t.retry_once().await, 0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(t.retry_once().await, 1);

        let new_hash = poster.posted()[0].hash();
        assert_eq!(t.get_state(&new_hash), EnvelopeState::Posted);

        // the retried envelope still backs the message
        t.handle_event(EnvelopeEvent::sent(new_hash, peer(1)));
        assert_eq!(handler.sent(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let handler = Arc::new(RecordingHandler::new());
        let poster = Arc::new(SealingPoster::new(Arc::new(ManualClock::new(1_000))));
        let t = EnvelopeTracker::new(
            TrackerConfig::default().with_max_attempts(2),
            no_mailservers(),
        )
        .with_handler(handler.clone())
        .with_poster(poster.clone());
        let id = MessageId::from_bytes([6; 32]);
        t.add(&[id], hash(1), msg());

        t.handle_event(EnvelopeEvent::Expired { hash: hash(1) });
        tokio::time::advance(Duration::from_secs(2)).await;
        t.retry_once().await;
        let second = poster.posted()[0].hash();

        t.handle_event(EnvelopeEvent::Expired { hash: second });
        assert_eq!(t.pending_retries(), 0);
        assert_eq!(handler.expired(), vec![(id, DeliveryError::Expired(second))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_repost_expires_message() {
        let handler = Arc::new(RecordingHandler::new());
        let poster = Arc::new(SealingPoster::new(Arc::new(ManualClock::new(1_000))));
        poster.set_failing(true);
        let t = EnvelopeTracker::new(
            TrackerConfig::default().with_max_attempts(2),
            no_mailservers(),
        )
        .with_handler(handler.clone())
        .with_poster(poster.clone());
        let id = MessageId::from_bytes([8; 32]);
        t.add(&[id], hash(1), msg());

        t.handle_event(EnvelopeEvent::Expired { hash: hash(1) });
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(t.retry_once().await, 0);

        assert_eq!(poster.attempts(), 1);
        assert_eq!(t.pending_retries(), 0);
        assert_eq!(handler.expired().len(), 1);
        assert!(matches!(handler.expired()[0].1, DeliveryError::Post(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_batches_are_pruned() {
        let t = tracker();
        t.add(&[], hash(1), msg());
        t.handle_event(EnvelopeEvent::sent_in_batch(hash(1), hash(100), peer(1)));
        t.handle_event(EnvelopeEvent::acknowledged(hash(101), peer(1)));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(t.prune_stale(), 0);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(t.prune_stale(), 2);

        // the acknowledgement no longer finds the batch
        t.handle_event(EnvelopeEvent::acknowledged(hash(100), peer(1)));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Posted);
    }

    #[tokio::test]
    async fn test_wait_for_confirmation() {
        let t = Arc::new(tracker());
        t.add(&[], hash(1), msg());

        let waiter = {
            let t = t.clone();
            tokio::spawn(async move { t.wait_for_confirmation(&hash(1), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.handle_event(EnvelopeEvent::sent(hash(1), peer(1)));

        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert_eq!(
            t.wait_for_confirmation(&hash(1), Duration::from_secs(1)).await,
            Ok(())
        );
        assert_eq!(
            t.wait_for_confirmation(&hash(9), Duration::from_secs(1)).await,
            Err(DeliveryError::NotTracked(hash(9)))
        );
    }

    #[tokio::test]
    async fn test_wait_reports_expiry() {
        let t = Arc::new(tracker());
        t.add(&[], hash(1), msg());

        let waiter = {
            let t = t.clone();
            tokio::spawn(async move { t.wait_for_confirmation(&hash(1), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.handle_event(EnvelopeEvent::Expired { hash: hash(1) });

        assert_eq!(waiter.await.unwrap(), Err(DeliveryError::Expired(hash(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let t = tracker();
        t.add(&[], hash(1), msg());

        let result = t.wait_for_confirmation(&hash(1), Duration::from_secs(3)).await;
        assert_eq!(result, Err(DeliveryError::Timeout(hash(1))));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::Posted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_processes_events_in_order() {
        let t = Arc::new(tracker());
        t.add(&[], hash(1), msg());
        t.add(&[], hash(2), msg());

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = t.spawn_dispatcher(rx, shutdown_rx);

        tx.send(EnvelopeEvent::Expired { hash: hash(1) }).await.unwrap();
        tx.send(EnvelopeEvent::sent(hash(1), peer(1))).await.unwrap();
        tx.send(EnvelopeEvent::sent(hash(2), peer(1))).await.unwrap();

        let confirmed = t.wait_for_confirmation(&hash(2), Duration::from_secs(5)).await;
        assert_eq!(confirmed, Ok(()));
        assert_eq!(t.get_state(&hash(1)), EnvelopeState::NotTracked);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}

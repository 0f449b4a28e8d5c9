//! Sync-state ledger for multi-device delivery.
//!
//! For every `(group, message, peer)` the ledger keeps how often the
//! message was sent to that peer and the epoch at which it becomes due
//! again. Each send pushes the next due epoch out exponentially. The due
//! epoch never moves backwards.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use courier_core::{GroupId, MessageId, PeerId};
use tracing::debug;

/// Ledger key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncKey {
    pub group: GroupId,
    pub message: MessageId,
    pub peer: PeerId,
}

impl SyncKey {
    pub fn new(group: GroupId, message: MessageId, peer: PeerId) -> Self {
        Self {
            group,
            message,
            peer,
        }
    }
}

/// Send accounting for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncState {
    pub send_count: u32,
    /// Epoch at or after which the message should be sent again.
    pub send_epoch: u64,
}

/// Configuration for the ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Epochs between the first and second send.
    pub base_interval: u64,
    /// Sends per key after which retransmission stops.
    pub max_send_count: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_interval: 1,
            max_send_count: 8,
        }
    }
}

impl LedgerConfig {
    pub fn with_base_interval(mut self, base_interval: u64) -> Self {
        self.base_interval = base_interval;
        self
    }

    pub fn with_max_send_count(mut self, max_send_count: u32) -> Self {
        self.max_send_count = max_send_count;
        self
    }

    /// Epochs to wait after the `count`-th send: `base * 2^(count - 1)`.
    pub fn interval_after(&self, count: u32) -> u64 {
        let factor = 2u64.saturating_pow(count.saturating_sub(1));
        self.base_interval.saturating_mul(factor)
    }
}

/// Per-peer, per-message retransmission ledger.
#[derive(Debug, Default)]
pub struct SyncLedger {
    config: LedgerConfig,
    entries: Mutex<HashMap<SyncKey, SyncState>>,
}

impl SyncLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SyncKey, SyncState>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a send of `key` at `epoch`, returning the updated state.
    pub fn record_send(&self, key: SyncKey, epoch: u64) -> SyncState {
        let mut entries = self.lock();
        let state = entries.entry(key).or_default();
        state.send_count = state.send_count.saturating_add(1);
        let next = epoch.saturating_add(self.config.interval_after(state.send_count));
        state.send_epoch = state.send_epoch.max(next);
        debug!(
            peer = %key.peer,
            message = %key.message,
            count = state.send_count,
            next_epoch = state.send_epoch,
            "recorded send"
        );
        *state
    }

    pub fn get(&self, key: &SyncKey) -> Option<SyncState> {
        self.lock().get(key).copied()
    }

    /// Whether `key` should be sent at `epoch`. Unknown keys have never been
    /// sent and are always due.
    pub fn should_retransmit(&self, key: &SyncKey, epoch: u64) -> bool {
        match self.lock().get(key) {
            None => true,
            Some(state) => self.is_due(state, epoch),
        }
    }

    fn is_due(&self, state: &SyncState, epoch: u64) -> bool {
        state.send_epoch <= epoch && state.send_count < self.config.max_send_count
    }

    /// Every tracked key due at `epoch`, sorted.
    pub fn due(&self, epoch: u64) -> Vec<SyncKey> {
        let mut keys: Vec<SyncKey> = self
            .lock()
            .iter()
            .filter(|(_, state)| self.is_due(state, epoch))
            .map(|(key, _)| *key)
            .collect();
        keys.sort();
        keys
    }

    /// The peer confirmed the message. Returns whether the key was tracked.
    pub fn acknowledge(&self, key: &SyncKey) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Forget a message for every peer. Returns the number of entries removed.
    pub fn remove_message(&self, group: &GroupId, message: &MessageId) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !(key.group == *group && key.message == *message));
        before - entries.len()
    }

    /// Forget a peer for every message. Returns the number of entries removed.
    pub fn remove_peer(&self, peer: &PeerId) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| key.peer != *peer);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(group: u8, message: u8, peer: u8) -> SyncKey {
        SyncKey::new(
            GroupId::from_bytes([group; 32]),
            MessageId::from_bytes([message; 32]),
            PeerId::from_bytes([peer; 32]),
        )
    }

    #[test]
    fn test_send_epoch_backs_off() {
        let ledger = SyncLedger::new(LedgerConfig::default().with_base_interval(2));
        let k = key(1, 1, 1);

        assert_eq!(ledger.record_send(k, 10), SyncState { send_count: 1, send_epoch: 12 });
        assert_eq!(ledger.record_send(k, 12), SyncState { send_count: 2, send_epoch: 16 });
        assert_eq!(ledger.record_send(k, 16), SyncState { send_count: 3, send_epoch: 24 });
    }

    #[test]
    fn test_send_epoch_never_decreases() {
        let ledger = SyncLedger::new(LedgerConfig::default());
        let k = key(1, 1, 1);
        ledger.record_send(k, 100);
        let state = ledger.record_send(k, 5);
        assert_eq!(state.send_epoch, 101);
    }

    #[test]
    fn test_should_retransmit() {
        let ledger = SyncLedger::new(LedgerConfig::default().with_max_send_count(2));
        let k = key(1, 1, 1);
        assert!(ledger.should_retransmit(&k, 0));

        ledger.record_send(k, 10);
        assert!(!ledger.should_retransmit(&k, 10));
        assert!(ledger.should_retransmit(&k, 11));

        ledger.record_send(k, 11);
        assert!(!ledger.should_retransmit(&k, 1_000));
    }

    #[test]
    fn test_due() {
        let ledger = SyncLedger::new(LedgerConfig::default());
        ledger.record_send(key(1, 1, 1), 10);
        ledger.record_send(key(1, 1, 2), 20);
        ledger.record_send(key(1, 2, 1), 5);

        assert_eq!(ledger.due(11), vec![key(1, 1, 1), key(1, 2, 1)]);
        assert!(ledger.due(5).is_empty());
    }

    #[test]
    fn test_teardown() {
        let ledger = SyncLedger::new(LedgerConfig::default());
        ledger.record_send(key(1, 1, 1), 0);
        ledger.record_send(key(1, 1, 2), 0);
        ledger.record_send(key(1, 2, 1), 0);
        ledger.record_send(key(2, 1, 1), 0);

        assert!(ledger.acknowledge(&key(2, 1, 1)));
        assert!(!ledger.acknowledge(&key(2, 1, 1)));
        assert_eq!(
            ledger.remove_message(&GroupId::from_bytes([1; 32]), &MessageId::from_bytes([1; 32])),
            2
        );
        assert_eq!(ledger.remove_peer(&PeerId::from_bytes([1; 32])), 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_interval_saturates() {
        let config = LedgerConfig::default().with_base_interval(u64::MAX / 2);
        assert_eq!(config.interval_after(0), u64::MAX / 2);
        assert_eq!(config.interval_after(1), u64::MAX / 2);
        assert_eq!(config.interval_after(3), u64::MAX);
        assert_eq!(config.interval_after(200), u64::MAX);
    }

    proptest! {
        #[test]
        fn prop_send_epoch_monotonic(epochs in proptest::collection::vec(0u64..1_000_000, 1..32)) {
            let ledger = SyncLedger::new(LedgerConfig::default());
            let k = key(1, 1, 1);
            let mut previous = 0;
            for epoch in epochs {
                let state = ledger.record_send(k, epoch);
                prop_assert!(state.send_epoch >= previous);
                prop_assert!(state.send_epoch > epoch);
                previous = state.send_epoch;
            }
        }
    }
}

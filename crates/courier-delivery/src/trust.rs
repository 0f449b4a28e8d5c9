//! Deciding whose confirmations count.
//!
//! With mailserver-only confirmations enabled, acknowledgements and
//! "already received" reports are honored only from peers the registry
//! identifies as mailservers. The check runs when an event is processed,
//! so a peer promoted after tracking began is honored.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use courier_core::PeerId;

/// Answers whether a peer is a mailserver.
pub trait MailserverRegistry: Send + Sync {
    fn is_mailserver(&self, peer: &PeerId) -> bool;
}

impl<F> MailserverRegistry for F
where
    F: Fn(&PeerId) -> bool + Send + Sync,
{
    fn is_mailserver(&self, peer: &PeerId) -> bool {
        self(peer)
    }
}

/// A mutable set of known mailservers.
#[derive(Debug, Default)]
pub struct StaticMailservers {
    peers: RwLock<HashSet<PeerId>>,
}

impl StaticMailservers {
    pub fn new(peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            peers: RwLock::new(peers.into_iter().collect()),
        }
    }

    pub fn add(&self, peer: PeerId) -> bool {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer)
    }

    pub fn remove(&self, peer: &PeerId) -> bool {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer)
    }
}

impl MailserverRegistry for StaticMailservers {
    fn is_mailserver(&self, peer: &PeerId) -> bool {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(peer)
    }
}

/// The trust predicate applied to confirmations.
#[derive(Clone)]
pub struct TrustPolicy {
    mailserver_confirmations: bool,
    registry: Arc<dyn MailserverRegistry>,
}

impl TrustPolicy {
    pub fn new(mailserver_confirmations: bool, registry: Arc<dyn MailserverRegistry>) -> Self {
        Self {
            mailserver_confirmations,
            registry,
        }
    }

    pub fn mailserver_confirmations(&self) -> bool {
        self.mailserver_confirmations
    }

    pub fn is_trusted(&self, peer: &PeerId) -> bool {
        !self.mailserver_confirmations || self.registry.is_mailserver(peer)
    }
}

impl std::fmt::Debug for TrustPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustPolicy")
            .field("mailserver_confirmations", &self.mailserver_confirmations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_trusts_everyone() {
        let policy = TrustPolicy::new(false, Arc::new(StaticMailservers::default()));
        assert!(policy.is_trusted(&PeerId::from_bytes([1; 32])));
    }

    #[test]
    fn test_mailserver_only() {
        let ms = PeerId::from_bytes([1; 32]);
        let registry = Arc::new(StaticMailservers::new([ms]));
        let policy = TrustPolicy::new(true, registry.clone());

        assert!(policy.is_trusted(&ms));
        assert!(!policy.is_trusted(&PeerId::from_bytes([2; 32])));

        // evaluated on every call
        registry.add(PeerId::from_bytes([2; 32]));
        assert!(policy.is_trusted(&PeerId::from_bytes([2; 32])));
        registry.remove(&ms);
        assert!(!policy.is_trusted(&ms));
    }

    #[test]
    fn test_closure_registry() {
        let policy = TrustPolicy::new(true, Arc::new(|p: &PeerId| p.as_bytes()[0] == 9));
        assert!(policy.is_trusted(&PeerId::from_bytes([9; 32])));
        assert!(!policy.is_trusted(&PeerId::from_bytes([8; 32])));
    }
}

//! Transport seam for pushing matched envelopes to a peer.
//!
//! The mailserver hands envelopes to an [`EnvelopeSink`] in bundles. How
//! bytes reach the peer (direct p2p message, gossip, RPC) is up to the
//! implementation.

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::PeerId;

use crate::error::Result;

/// Destination for envelopes served from the archive.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    /// Deliver one bundle of encoded envelopes to `peer`, in order.
    async fn send_envelopes(&self, peer: &PeerId, envelopes: Vec<Bytes>) -> Result<()>;
}

/// In-memory sinks for tests and local wiring.
pub mod memory {
    use super::*;
    use std::sync::{Mutex, PoisonError};

    use courier_core::Envelope;
    use tokio::sync::mpsc;

    use crate::error::MailserverError;

    /// One bundle as it left the mailserver.
    #[derive(Debug, Clone)]
    pub struct Bundle {
        pub peer: PeerId,
        pub envelopes: Vec<Bytes>,
    }

    impl Bundle {
        /// Decode every envelope in the bundle.
        pub fn decode(&self) -> std::result::Result<Vec<Envelope>, courier_core::CoreError> {
            self.envelopes.iter().map(|raw| Envelope::decode(raw)).collect()
        }
    }

    /// Sink that forwards bundles over a bounded channel.
    ///
    /// A full channel applies backpressure to the mailserver. A dropped
    /// receiver looks like a disconnected peer.
    pub struct ChannelSink {
        tx: mpsc::Sender<Bundle>,
    }

    impl ChannelSink {
        pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bundle>) {
            let (tx, rx) = mpsc::channel(capacity);
            (Self { tx }, rx)
        }
    }

    #[async_trait]
    impl EnvelopeSink for ChannelSink {
        async fn send_envelopes(&self, peer: &PeerId, envelopes: Vec<Bytes>) -> Result<()> {
            self.tx
                .send(Bundle {
                    peer: *peer,
                    envelopes,
                })
                .await
                .map_err(|_| MailserverError::Sink("peer disconnected".into()))
        }
    }

    /// Sink that records every bundle.
    #[derive(Default)]
    pub struct RecordingSink {
        bundles: Mutex<Vec<Bundle>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn bundles(&self) -> Vec<Bundle> {
            self.bundles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// All envelopes received, flattened and decoded, in arrival order.
        pub fn envelopes(&self) -> Vec<Envelope> {
            self.bundles()
                .iter()
                .flat_map(|b| b.envelopes.iter())
                .filter_map(|raw| Envelope::decode(raw).ok())
                .collect()
        }

        pub fn clear(&self) {
            self.bundles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    #[async_trait]
    impl EnvelopeSink for RecordingSink {
        async fn send_envelopes(&self, peer: &PeerId, envelopes: Vec<Bytes>) -> Result<()> {
            self.bundles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Bundle {
                    peer: *peer,
                    envelopes,
                });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{ChannelSink, RecordingSink};
    use super::*;
    use crate::error::MailserverError;
    use courier_core::{Envelope, Topic};

    fn raw(n: u8) -> Bytes {
        Bytes::from(Envelope::new(100, 10, Topic::from_u32(1), vec![n]).encode())
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::channel(4);
        let peer = PeerId::from_bytes([0xAA; 32]);

        sink.send_envelopes(&peer, vec![raw(1), raw(2)]).await.unwrap();
        sink.send_envelopes(&peer, vec![raw(3)]).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.peer, peer);
        let payloads: Vec<u8> = first.decode().unwrap().iter().map(|e| e.payload[0]).collect();
        assert_eq!(payloads, vec![1, 2]);
        assert_eq!(rx.recv().await.unwrap().envelopes.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_sink_reports_disconnect() {
        let (sink, rx) = ChannelSink::channel(1);
        drop(rx);
        let err = sink
            .send_envelopes(&PeerId::ZERO, vec![raw(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, MailserverError::Sink(_)));
    }

    #[tokio::test]
    async fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.send_envelopes(&PeerId::ZERO, vec![raw(1)]).await.unwrap();
        sink.send_envelopes(&PeerId::ZERO, vec![raw(2), raw(3)]).await.unwrap();

        assert_eq!(sink.bundles().len(), 2);
        assert_eq!(sink.envelopes().len(), 3);
        sink.clear();
        assert!(sink.envelopes().is_empty());
    }
}

//! Delivery tracking through a running node.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use courier::core::{BatchHash, GroupId, ManualClock, MessageId, NewMessage, PeerId, Topic};
use courier::delivery::handler::memory::{RecordingHandler, SealingPoster};
use courier::delivery::{
    DeliveryError, EnvelopeError, EnvelopeErrorCode, EnvelopeEvent, EnvelopeState, SyncKey,
};
use courier::store::MemoryStore;
use courier::{Node, NodeConfig};
use courier_testkit::init_test_logging;

const TOPIC: Topic = Topic::from_u32(0xAABBCCDD);

fn message() -> NewMessage {
    NewMessage::new(TOPIC, 60, b"hello".to_vec())
}

#[tokio::test]
async fn test_direct_send_confirms_message() -> Result<()> {
    init_test_logging();
    let handler = Arc::new(RecordingHandler::new());
    let node = Node::builder(NodeConfig::default(), Arc::new(MemoryStore::new()))
        .clock(Arc::new(ManualClock::new(1_000)))
        .handler(handler.clone())
        .build()?;
    let handle = node.start();

    let id = MessageId::random();
    let envelope = node.post(&[id], message());
    assert_eq!(envelope.timestamp(), 1_000);
    assert_eq!(node.tracker().get_state(&envelope.hash()), EnvelopeState::Posted);

    handle
        .send_event(EnvelopeEvent::sent(envelope.hash(), PeerId::random()))
        .await?;
    node.tracker()
        .wait_for_confirmation(&envelope.hash(), Duration::from_secs(5))
        .await?;

    handle.shutdown().await?;
    assert_eq!(handler.sent(), vec![id]);
    assert!(handler.expired().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_batch_needs_trusted_acknowledgement() -> Result<()> {
    let mailserver = PeerId::random();
    let config = NodeConfig::from_json(&format!(
        r#"{{"tracker": {{"mailserver_confirmations": true}}, "mailservers": ["{}"]}}"#,
        hex::encode(mailserver.as_bytes())
    ))?;
    let handler = Arc::new(RecordingHandler::new());
    let node = Node::builder(config, Arc::new(MemoryStore::new()))
        .handler(handler.clone())
        .build()?;
    let handle = node.start();

    let id = MessageId::random();
    let envelope = node.post(&[id], message());
    let batch = BatchHash::random();

    handle
        .send_event(EnvelopeEvent::sent_in_batch(envelope.hash(), batch, PeerId::random()))
        .await?;
    handle
        .send_event(EnvelopeEvent::acknowledged(batch, PeerId::random()))
        .await?;

    let early = node
        .tracker()
        .wait_for_confirmation(&envelope.hash(), Duration::from_millis(100))
        .await;
    assert_eq!(early, Err(DeliveryError::Timeout(envelope.hash())));

    handle
        .send_event(EnvelopeEvent::acknowledged(batch, mailserver))
        .await?;
    node.tracker()
        .wait_for_confirmation(&envelope.hash(), Duration::from_secs(5))
        .await?;

    handle.shutdown().await?;
    assert_eq!(handler.sent(), vec![id]);
    Ok(())
}

#[tokio::test]
async fn test_rejection_without_poster_expires_message() -> Result<()> {
    let handler = Arc::new(RecordingHandler::new());
    let node = Node::builder(NodeConfig::default(), Arc::new(MemoryStore::new()))
        .handler(handler.clone())
        .build()?;
    let handle = node.start();

    let id = MessageId::random();
    let envelope = node.post(&[id], message());
    let batch = BatchHash::random();
    let peer = PeerId::random();

    handle
        .send_event(EnvelopeEvent::sent_in_batch(envelope.hash(), batch, peer))
        .await?;
    handle
        .send_event(EnvelopeEvent::BatchAcknowledged {
            batch,
            peer,
            errors: vec![EnvelopeError::new(
                envelope.hash(),
                EnvelopeErrorCode::TimeNotSynced,
                "clock skew",
            )],
        })
        .await?;

    let outcome = node
        .tracker()
        .wait_for_confirmation(&envelope.hash(), Duration::from_secs(5))
        .await;

    handle.shutdown().await?;
    // the waiter may register after the failure already removed the envelope
    assert!(matches!(
        outcome,
        Err(DeliveryError::Rejected { .. }) | Err(DeliveryError::NotTracked(_))
    ));
    let expired = handler.expired();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].0, id);
    assert!(matches!(expired[0].1, DeliveryError::Rejected { .. }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_expired_envelope_is_reposted() -> Result<()> {
    let clock = Arc::new(ManualClock::new(5_000));
    let handler = Arc::new(RecordingHandler::new());
    let poster = Arc::new(SealingPoster::new(clock.clone()));
    let node = Node::builder(NodeConfig::default(), Arc::new(MemoryStore::new()))
        .clock(clock.clone())
        .handler(handler.clone())
        .poster(poster.clone())
        .build()?;

    let id = MessageId::random();
    let first = node.post(&[id], message());
    node.tracker()
        .handle_event(EnvelopeEvent::Expired { hash: first.hash() });
    assert_eq!(node.tracker().pending_retries(), 1);
    assert!(handler.expired().is_empty());

    // back off past the first retry delay
    clock.advance(10);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(node.tracker().retry_once().await, 1);

    let reposted = poster.posted();
    assert_eq!(reposted.len(), 1);
    let second = reposted[0].hash();
    assert_ne!(second, first.hash());
    assert_eq!(node.tracker().get_state(&second), EnvelopeState::Posted);

    node.tracker()
        .handle_event(EnvelopeEvent::sent(second, PeerId::random()));
    assert_eq!(node.tracker().get_state(&second), EnvelopeState::Sent);
    assert_eq!(handler.sent(), vec![id]);
    Ok(())
}

#[tokio::test]
async fn test_sync_ledger_backs_off() {
    let node = Node::new(NodeConfig::default(), Arc::new(MemoryStore::new())).expect("node");
    let ledger = node.ledger();
    let key = SyncKey::new(GroupId::random(), MessageId::random(), PeerId::random());

    ledger.record_send(key, 10);
    assert!(!ledger.should_retransmit(&key, 10));
    assert!(ledger.should_retransmit(&key, 11));

    ledger.record_send(key, 11);
    assert!(!ledger.should_retransmit(&key, 12));

    ledger.acknowledge(&key);
    assert!(ledger.get(&key).is_none());
}

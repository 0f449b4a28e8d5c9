//! The Node: one process worth of courier components.
//!
//! Wires the envelope tracker, the mailserver and the sync ledger around a
//! shared store and clock, and owns their background tasks.

use std::sync::Arc;

use courier_core::{Clock, Envelope, MessageId, NewMessage, SystemClock};
use courier_delivery::{
    DeliveryHandler, EnvelopeEvent, EnvelopePoster, EnvelopeTracker, StaticMailservers,
    SyncLedger,
};
use courier_mailserver::Mailserver;
use courier_store::{KvStore, RetentionCleaner};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};

/// Builder for [`Node`] when the defaults need replacing.
pub struct NodeBuilder {
    config: NodeConfig,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    handler: Option<Arc<dyn DeliveryHandler>>,
    poster: Option<Arc<dyn EnvelopePoster>>,
}

impl NodeBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn DeliveryHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Enables tracker retries.
    pub fn poster(mut self, poster: Arc<dyn EnvelopePoster>) -> Self {
        self.poster = Some(poster);
        self
    }

    pub fn build(self) -> Result<Node> {
        self.config.validate()?;

        let mailservers = Arc::new(StaticMailservers::new(self.config.mailserver_peers()?));
        let mut tracker = EnvelopeTracker::new(self.config.tracker_config(), mailservers.clone());
        if let Some(handler) = self.handler {
            tracker = tracker.with_handler(handler);
        }
        if let Some(poster) = self.poster {
            tracker = tracker.with_poster(poster);
        }

        let mailserver = Mailserver::new(
            self.store.clone(),
            self.clock.clone(),
            self.config.mailserver_config(),
        );
        let ledger = SyncLedger::new(self.config.ledger_config());

        Ok(Node {
            config: self.config,
            store: self.store,
            clock: self.clock,
            mailservers,
            tracker: Arc::new(tracker),
            mailserver: Arc::new(mailserver),
            ledger: Arc::new(ledger),
        })
    }
}

/// A configured set of courier components.
pub struct Node {
    config: NodeConfig,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    mailservers: Arc<StaticMailservers>,
    tracker: Arc<EnvelopeTracker>,
    mailserver: Arc<Mailserver>,
    ledger: Arc<SyncLedger>,
}

impl Node {
    /// Build a node on the system clock with no handler and no retries.
    pub fn new(config: NodeConfig, store: Arc<dyn KvStore>) -> Result<Self> {
        Self::builder(config, store).build()
    }

    pub fn builder(config: NodeConfig, store: Arc<dyn KvStore>) -> NodeBuilder {
        NodeBuilder {
            config,
            store,
            clock: Arc::new(SystemClock),
            handler: None,
            poster: None,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The trusted-mailserver set. Changes apply to the next event processed.
    pub fn mailservers(&self) -> &Arc<StaticMailservers> {
        &self.mailservers
    }

    pub fn tracker(&self) -> &Arc<EnvelopeTracker> {
        &self.tracker
    }

    pub fn mailserver(&self) -> &Arc<Mailserver> {
        &self.mailserver
    }

    pub fn ledger(&self) -> &Arc<SyncLedger> {
        &self.ledger
    }

    /// Seal `message` at the current time and start tracking it. The
    /// returned envelope is what the transport should publish.
    pub fn post(&self, message_ids: &[MessageId], message: NewMessage) -> Envelope {
        let now = u32::try_from(self.clock.now_secs()).unwrap_or(u32::MAX);
        let envelope = message.seal(now);
        self.tracker.add(message_ids, envelope.hash(), message);
        debug!(hash = %envelope.hash(), "posted envelope");
        envelope
    }

    /// Spawn the background tasks.
    pub fn start(&self) -> NodeHandle {
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = vec![
            self.tracker.spawn_dispatcher(events_rx, shutdown_rx.clone()),
            self.mailserver.spawn_maintenance(shutdown_rx.clone()),
        ];
        if let Some(retention) = self.config.retention_config() {
            let cleaner = RetentionCleaner::new(self.store.clone(), self.clock.clone(), retention);
            tasks.push(cleaner.spawn(shutdown_rx));
        }

        info!(tasks = tasks.len(), "node started");
        NodeHandle {
            events: events_tx,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Handle to a running node's background tasks.
pub struct NodeHandle {
    events: mpsc::Sender<EnvelopeEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// Sender for transport events, to hand to the transport.
    pub fn events(&self) -> mpsc::Sender<EnvelopeEvent> {
        self.events.clone()
    }

    pub async fn send_event(&self, event: EnvelopeEvent) -> Result<()> {
        self.events.send(event).await.map_err(|_| NodeError::Stopped)
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) -> Result<()> {
        // tasks that already exited dropped their receivers
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await.map_err(|e| NodeError::Task(e.to_string()))?;
        }
        info!("node stopped");
        Ok(())
    }
}

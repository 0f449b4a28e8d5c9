//! Node configuration.
//!
//! Loaded from JSON. Every field has a default, so `{}` is a valid
//! configuration. Durations are whole seconds.

use std::path::Path;
use std::time::Duration;

use courier_core::PeerId;
use courier_delivery::{LedgerConfig, TrackerConfig};
use courier_mailserver::{limits, MailserverConfig, TrafficConfig};
use courier_store::RetentionConfig;
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub tracker: TrackerSection,
    pub mailserver: MailserverSection,
    pub traffic: TrafficSection,
    /// Absent disables the retention cleaner.
    pub retention: Option<RetentionSection>,
    pub ledger: LedgerSection,
    /// Hex-encoded ids of peers trusted as mailservers.
    pub mailservers: Vec<String>,
    /// Capacity of the transport event channel.
    pub event_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerSection::default(),
            mailserver: MailserverSection::default(),
            traffic: TrafficSection::default(),
            retention: None,
            ledger: LedgerSection::default(),
            mailservers: Vec::new(),
            event_buffer: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    pub max_attempts: u32,
    pub mailserver_confirmations: bool,
    pub batch_timeout_secs: u64,
}

impl Default for TrackerSection {
    fn default() -> Self {
        let defaults = TrackerConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            mailserver_confirmations: defaults.mailserver_confirmations,
            batch_timeout_secs: defaults.batch_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailserverSection {
    pub max_limit: u32,
    pub default_window_secs: u32,
    pub max_query_range_secs: Option<u64>,
    pub rate_limit_secs: Option<u64>,
    pub max_message_size: usize,
    pub send_timeout_secs: u64,
    pub scan_page_size: usize,
    pub prune_interval_secs: u64,
}

impl Default for MailserverSection {
    fn default() -> Self {
        let defaults = MailserverConfig::default();
        Self {
            max_limit: defaults.max_limit,
            default_window_secs: defaults.default_window_secs,
            max_query_range_secs: None,
            rate_limit_secs: None,
            max_message_size: defaults.max_message_size,
            send_timeout_secs: defaults.send_timeout.as_secs(),
            scan_page_size: defaults.scan_page_size,
            prune_interval_secs: defaults.prune_interval.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficSection {
    pub capacity_bytes: u64,
    pub refill_bytes_per_sec: u64,
    pub max_debt_bytes: u64,
    pub throttle_threshold: u32,
}

impl Default for TrafficSection {
    fn default() -> Self {
        let defaults = TrafficConfig::default();
        Self {
            capacity_bytes: defaults.capacity,
            refill_bytes_per_sec: defaults.refill_per_sec,
            max_debt_bytes: defaults.max_debt,
            throttle_threshold: defaults.throttle_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub max_age_secs: u64,
    pub interval_secs: u64,
    pub batch_size: usize,
}

impl Default for RetentionSection {
    fn default() -> Self {
        let defaults = RetentionConfig::default();
        Self {
            max_age_secs: defaults.max_age.as_secs(),
            interval_secs: defaults.interval.as_secs(),
            batch_size: defaults.batch_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub base_interval: u64,
    pub max_send_count: u32,
}

impl Default for LedgerSection {
    fn default() -> Self {
        let defaults = LedgerConfig::default();
        Self {
            base_interval: defaults.base_interval,
            max_send_count: defaults.max_send_count,
        }
    }
}

impl NodeConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check values that would make a component misbehave.
    pub fn validate(&self) -> Result<()> {
        let ms = &self.mailserver;
        if ms.max_limit == 0 || ms.max_limit > limits::MAX_LIMIT_IN_MESSAGES_REQUEST {
            return Err(NodeError::Config(format!(
                "mailserver.max_limit must be in 1..={}",
                limits::MAX_LIMIT_IN_MESSAGES_REQUEST
            )));
        }
        if ms.default_window_secs == 0 {
            return Err(NodeError::Config("mailserver.default_window_secs must be positive".into()));
        }
        if ms.max_message_size == 0 {
            return Err(NodeError::Config("mailserver.max_message_size must be positive".into()));
        }
        if ms.scan_page_size == 0 {
            return Err(NodeError::Config("mailserver.scan_page_size must be positive".into()));
        }
        if ms.send_timeout_secs == 0 {
            return Err(NodeError::Config("mailserver.send_timeout_secs must be positive".into()));
        }
        if ms.prune_interval_secs == 0 {
            return Err(NodeError::Config("mailserver.prune_interval_secs must be positive".into()));
        }
        if self.traffic.capacity_bytes == 0 {
            return Err(NodeError::Config("traffic.capacity_bytes must be positive".into()));
        }
        if self.tracker.max_attempts == 0 {
            return Err(NodeError::Config("tracker.max_attempts must be positive".into()));
        }
        if self.tracker.batch_timeout_secs == 0 {
            return Err(NodeError::Config("tracker.batch_timeout_secs must be positive".into()));
        }
        if let Some(retention) = &self.retention {
            if retention.max_age_secs == 0 || retention.interval_secs == 0 || retention.batch_size == 0 {
                return Err(NodeError::Config(
                    "retention values must all be positive".into(),
                ));
            }
        }
        if self.ledger.max_send_count == 0 {
            return Err(NodeError::Config("ledger.max_send_count must be positive".into()));
        }
        if self.event_buffer == 0 {
            return Err(NodeError::Config("event_buffer must be positive".into()));
        }
        if self.tracker.mailserver_confirmations && self.mailservers.is_empty() {
            tracing::warn!("mailserver confirmations enabled with no known mailservers");
        }
        self.mailserver_peers()?;
        Ok(())
    }

    /// Decode the configured mailserver ids.
    pub fn mailserver_peers(&self) -> Result<Vec<PeerId>> {
        self.mailservers
            .iter()
            .map(|hex| {
                PeerId::from_hex(hex)
                    .map_err(|e| NodeError::Config(format!("bad mailserver id {hex}: {e}")))
            })
            .collect()
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig::default()
            .with_max_attempts(self.tracker.max_attempts)
            .with_mailserver_confirmations(self.tracker.mailserver_confirmations)
            .with_batch_timeout(Duration::from_secs(self.tracker.batch_timeout_secs))
    }

    pub fn traffic_config(&self) -> TrafficConfig {
        TrafficConfig::default()
            .with_capacity(self.traffic.capacity_bytes)
            .with_refill_per_sec(self.traffic.refill_bytes_per_sec)
            .with_max_debt(self.traffic.max_debt_bytes)
            .with_throttle_threshold(self.traffic.throttle_threshold)
    }

    pub fn mailserver_config(&self) -> MailserverConfig {
        let ms = &self.mailserver;
        let mut config = MailserverConfig {
            max_limit: ms.max_limit,
            default_window_secs: ms.default_window_secs,
            prune_interval: Duration::from_secs(ms.prune_interval_secs),
            ..MailserverConfig::default()
        }
        .with_max_message_size(ms.max_message_size)
        .with_send_timeout(Duration::from_secs(ms.send_timeout_secs))
        .with_scan_page_size(ms.scan_page_size)
        .with_traffic(self.traffic_config());
        if let Some(secs) = ms.max_query_range_secs {
            config = config.with_max_query_range(Duration::from_secs(secs));
        }
        if let Some(secs) = ms.rate_limit_secs {
            config = config.with_rate_limit_interval(Duration::from_secs(secs));
        }
        config
    }

    pub fn retention_config(&self) -> Option<RetentionConfig> {
        self.retention.as_ref().map(|r| {
            RetentionConfig::default()
                .with_max_age(Duration::from_secs(r.max_age_secs))
                .with_interval(Duration::from_secs(r.interval_secs))
                .with_batch_size(r.batch_size)
        })
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig::default()
            .with_base_interval(self.ledger.base_interval)
            .with_max_send_count(self.ledger.max_send_count)
    }
}

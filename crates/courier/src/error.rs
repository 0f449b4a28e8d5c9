//! Error types for the node facade.

use courier_core::CoreError;
use courier_delivery::DeliveryError;
use courier_mailserver::MailserverError;
use courier_store::StoreError;
use thiserror::Error;

/// Errors that can occur while configuring or running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration is malformed or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration JSON could not be parsed.
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("mailserver error: {0}")]
    Mailserver(#[from] MailserverError),

    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// The node's background tasks have stopped.
    #[error("node is stopped")]
    Stopped,

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

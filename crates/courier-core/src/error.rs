//! Error types for courier core.

use thiserror::Error;

/// Errors raised by the pure primitives in this crate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid db key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("invalid bloom filter size: {0}")]
    InvalidBloomSize(usize),

    #[error("invalid identifier length: expected {expected}, got {got}")]
    InvalidIdLength { expected: usize, got: usize },

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

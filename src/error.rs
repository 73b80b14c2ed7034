//! Error types for the last-price service.

use crate::types::{BatchRunId, SubscriberId};
use thiserror::Error;

/// Main error type for service operations.
#[derive(Debug, Error)]
pub enum LastPriceError {
    #[error("Malformed key: {0:?}")]
    MalformedKey(String),

    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Producer is not authorized: {0}")]
    UnauthorizedProducer(String),

    #[error("Instrument is not supported by the service: {0}")]
    WrongInstrument(String),

    #[error("Max number of active batches achieved: {0}")]
    TooManyActiveBatchRuns(usize),

    #[error("Batch was not found, id: {0}")]
    BatchNotFound(BatchRunId),

    #[error("Subscriber already attached: {0}")]
    SubscriberExists(SubscriberId),

    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(SubscriberId),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Service is shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for LastPriceError {
    fn from(e: serde_json::Error) -> Self {
        LastPriceError::InvalidConfig(e.to_string())
    }
}

impl From<::config::ConfigError> for LastPriceError {
    fn from(e: ::config::ConfigError) -> Self {
        LastPriceError::InvalidConfig(e.to_string())
    }
}

/// Failure reported by an egress sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Consumer disconnected")]
    Disconnected,

    #[error("Delivery cancelled by detach")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, LastPriceError>;

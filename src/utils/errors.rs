// src/utils/errors.rs
//! Error types for the tracking queue
//!
//! Failures fall into three groups:
//!
//! - **Recoverable domain errors** (`Domain`): one event was rejected by the
//!   sink. The batch handler truncates the batch and keeps going.
//! - **Storage errors** (`Backend`, `Persistence`): the queue store or the
//!   persistence engine is unreachable. The drain run is aborted.
//! - **Configuration errors** (`Config`): reported at startup or at the
//!   enable check, never silently ignored.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, QueueError>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum QueueError {
    /// Backing list/key store failed (connection, IO, SQL)
    #[error("Queue backend error: {0}")]
    Backend(String),

    /// Persistence engine could not reach its storage
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A single event was rejected (invalid site, malformed parameter)
    #[error("Invalid tracking event: {0}")]
    Domain(String),

    /// Queue entry could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid or unusable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The drain lock expired and was taken over while a batch was in flight
    #[error("Lost the queue lock while processing; in-flight batch was rolled back")]
    LockLost,
}

impl QueueError {
    /// Whether the batch handler may truncate-and-continue on this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, QueueError::Domain(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(e: config::ConfigError) -> Self {
        QueueError::Config(e.to_string())
    }
}

/// Error returned by a [`crate::sink::BatchSink`] for a single event
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistError {
    /// The event itself is bad; retrying it will not help
    #[error("{0}")]
    Invalid(String),

    /// The underlying storage failed
    #[error("{0}")]
    Storage(String),
}

impl From<PersistError> for QueueError {
    fn from(e: PersistError) -> Self {
        match e {
            PersistError::Invalid(msg) => QueueError::Domain(msg),
            PersistError::Storage(msg) => QueueError::Persistence(msg),
        }
    }
}

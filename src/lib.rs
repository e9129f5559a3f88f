// src/lib.rs
//! Tracking Queue Library
//!
//! Deferred ingestion for tracking events: requests are answered as soon as
//! their events are buffered, and a single lock-holding drainer persists the
//! buffer in transactional slices.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **tracking**: Events, request environment, event batches
//! - **backend**: List and key/value stores holding the queue and the lock
//! - **sink**: Persistence engines events are replayed into
//! - **queue**: Queue, drain lock, batch handler, processor, ingestion
//! - **observability**: Tracing and metrics setup
//! - **utils**: Configuration and errors

// Public module exports
pub mod backend;
pub mod observability;
pub mod queue;
pub mod sink;
pub mod tracking;
pub mod utils;

// Re-export commonly used types
pub use backend::{build_backend, QueueBackend};
pub use queue::{DrainOutcome, DrainReport, Processor, Queue, QueuedIngestor};
pub use sink::{build_sink, BatchSink};
pub use tracking::{Environment, Event, EventBatch};
pub use utils::config::TrackingConfig;
pub use utils::errors::{QueueError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

// src/queue/mod.rs
//! Deferred ingestion queue
//!
//! Tracking requests are answered as soon as their batch is in the queue.
//! Persisting happens later, in slices of `batch_size` batches, by whoever
//! holds the drain lock:
//!
//! - **Queue**: FIFO of serialized batches on a [`QueueBackend`]
//! - **DistributedLock**: owner-token lock with a TTL, one drainer at a time
//! - **BatchHandler**: replays a slice inside one sink transaction
//! - **Processor**: the drain loop
//! - **Admission**: decides whether an ingesting request drains inline
//! - **QueuedIngestor**: enqueue + opportunistic drain
//!
//! # Architecture
//!
//! ```text
//! submit() ──► Queue.enqueue ──► Admission ──DrainInline──┐
//!                                                          ▼
//! tracking-queue process ─────────────────────────► Processor.run
//!                                                          │
//!                            DistributedLock ◄── acquire / extend / release
//!                                                          │
//!                  Queue.peek ──► BatchHandler ──► BatchSink
//!                                                          │
//!                                     Queue.commit_processed + requeue
//! ```
//!
//! [`QueueBackend`]: crate::backend::QueueBackend

pub mod admission;
pub mod handler;
pub mod ingestor;
pub mod lock;
pub mod processor;
pub mod tracking_queue;

// Re-export commonly used types
pub use admission::{Admission, AdmissionDecision};
pub use handler::{BatchHandler, HandlerState};
pub use ingestor::{IngestReceipt, QueuedIngestor};
pub use lock::DistributedLock;
pub use processor::{DrainOutcome, DrainReport, Processor};
pub use tracking_queue::Queue;

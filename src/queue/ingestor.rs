// src/queue/ingestor.rs
//! Ingestion entry point used in place of direct persistence
//!
//! `submit` only has to get the batch into the queue for the client to be
//! answered. Draining that may follow is best effort: its failures are
//! logged and the batches stay queued for the next run.
//!
//! With queueing switched off the batch is persisted right away in a single
//! transaction, and any rejection is returned to the caller.

use crate::backend::QueueBackend;
use crate::queue::admission::{Admission, AdmissionDecision};
use crate::queue::handler::BatchHandler;
use crate::queue::processor::{DrainReport, Processor};
use crate::queue::tracking_queue::Queue;
use crate::sink::BatchSink;
use crate::tracking::EventBatch;
use crate::utils::config::TrackingConfig;
use crate::utils::errors::Result;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Outcome of one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    /// Number of events queued, or persisted when queueing is off
    pub events_accepted: usize,

    pub decision: AdmissionDecision,

    /// Report of the inline drain, if one ran and finished
    pub drain: Option<DrainReport>,
}

/// Queues incoming batches and drains opportunistically
pub struct QueuedIngestor {
    backend: Arc<dyn QueueBackend>,
    sink: Arc<dyn BatchSink>,
    queue: Queue,
    admission: Admission,
    config: TrackingConfig,
}

impl QueuedIngestor {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        sink: Arc<dyn BatchSink>,
        config: TrackingConfig,
    ) -> Self {
        Self {
            queue: Queue::new(backend.clone(), &config.queue),
            admission: Admission::new(&config.queue),
            backend,
            sink,
            config,
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Queue `batch`, then drain inline if the admission check says so
    ///
    /// Only a failed enqueue is returned as an error. When queueing is off
    /// the batch is persisted directly instead. A queue that is switched on
    /// but whose backend is unusable fails with `QueueError::Config`.
    pub async fn submit(&self, batch: &EventBatch) -> Result<IngestReceipt> {
        if !self.queue.is_enabled().await? {
            let persisted = self.persist_directly(batch).await?;
            return Ok(IngestReceipt {
                events_accepted: persisted,
                decision: AdmissionDecision::NotQueued,
                drain: None,
            });
        }

        self.queue.enqueue(batch).await?;
        debug!("Added {} events to queue", batch.len());

        let mut receipt = IngestReceipt {
            events_accepted: batch.len(),
            decision: AdmissionDecision::BelowThreshold,
            drain: None,
        };

        receipt.decision = match self.admission.decide(&self.queue).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Could not check queue size after enqueue: {}", e);
                AdmissionDecision::Deferred
            }
        };

        if receipt.decision == AdmissionDecision::DrainInline {
            let mut processor =
                Processor::from_config(self.backend.clone(), self.sink.clone(), &self.config);

            match processor.run().await {
                Ok(report) => receipt.drain = Some(report),
                Err(e) => error!("Failed to process queue: {}", e),
            }
        }

        Ok(receipt)
    }

    async fn persist_directly(&self, batch: &EventBatch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut handler = BatchHandler::new(self.sink.clone());
        handler.begin().await?;

        if let Err(e) = handler.replay(batch).await {
            handler.abort().await;
            return Err(e);
        }

        handler.finish().await?;
        debug!("Persisted {} events without queueing", handler.logged_events());

        Ok(handler.logged_events())
    }
}

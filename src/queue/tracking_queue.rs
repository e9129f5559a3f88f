// src/queue/tracking_queue.rs
//! FIFO buffer of serialized event batches
//!
//! The queue never removes an entry when reading it. The processor peeks a
//! slice of entries, replays them, and only then commits (trims) exactly that
//! many from the head. Anything that crashes in between leaves the entries in
//! place for the next run.

use crate::backend::QueueBackend;
use crate::tracking::EventBatch;
use crate::utils::config::QueueConfig;
use crate::utils::errors::{QueueError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handle on the shared batch list
#[derive(Clone)]
pub struct Queue {
    backend: Arc<dyn QueueBackend>,
    list_key: String,
    threshold: usize,
    enabled: bool,
}

impl Queue {
    pub fn new(backend: Arc<dyn QueueBackend>, config: &QueueConfig) -> Self {
        Self {
            backend,
            list_key: config.list_key.clone(),
            threshold: config.batch_size.max(1),
            enabled: config.enabled,
        }
    }

    /// Number of batches that must be queued before draining starts
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn list_key(&self) -> &str {
        &self.list_key
    }

    /// Append one batch; empty batches are ignored
    pub async fn enqueue(&self, batch: &EventBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let entry = batch.to_entry()?;
        self.backend.rpush(&self.list_key, &[entry]).await?;

        debug!("Queued batch of {} events", batch.len());

        Ok(())
    }

    /// Append several already-built batches in order
    pub async fn enqueue_all(&self, batches: &[EventBatch]) -> Result<()> {
        let entries = batches
            .iter()
            .filter(|b| !b.is_empty())
            .map(EventBatch::to_entry)
            .collect::<Result<Vec<_>>>()?;

        if entries.is_empty() {
            return Ok(());
        }

        self.backend.rpush(&self.list_key, &entries).await
    }

    /// Number of queued batches
    pub async fn size(&self) -> Result<usize> {
        self.backend.llen(&self.list_key).await
    }

    /// Whether enough batches are queued to start a drain
    pub async fn should_drain(&self) -> Result<bool> {
        Ok(self.size().await? >= self.threshold)
    }

    /// Up to `n` oldest batches, left in place
    ///
    /// An entry that no longer decodes is returned as an empty batch, so it
    /// keeps its position and is removed with the rest of the slice on
    /// commit instead of blocking the head of the queue.
    pub async fn peek_batches(&self, n: usize) -> Result<Vec<EventBatch>> {
        let entries = self.backend.lrange(&self.list_key, n).await?;

        let batches = entries
            .iter()
            .map(|entry| {
                EventBatch::from_entry(entry).unwrap_or_else(|e| {
                    warn!("Discarding undecodable queue entry: {}", e);
                    EventBatch::new(Vec::new(), Default::default())
                })
            })
            .collect();

        Ok(batches)
    }

    /// Remove the `n` oldest batches
    pub async fn commit_processed(&self, n: usize) -> Result<()> {
        self.backend.ltrim_front(&self.list_key, n).await
    }

    /// Whether queueing is switched on and its store usable
    ///
    /// When the flag is on but the store is unreachable this is an error
    /// rather than `false`, so misconfiguration is never silently ignored.
    pub async fn is_enabled(&self) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }

        self.backend.check_installed().await.map_err(|e| {
            QueueError::Config(format!(
                "Queued tracking is enabled but its backend is unusable: {}",
                e
            ))
        })?;

        Ok(true)
    }
}

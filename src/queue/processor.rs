// src/queue/processor.rs
//! Drain loop
//!
//! # Architecture
//!
//! ```text
//! record_statistics? ─no─► Disabled
//!        │
//! should_drain? ─no─► BelowThreshold
//!        │
//! acquire lock ─no─► Locked
//!        │
//!        ▼
//! ┌─► peek(threshold) ─► extend lock ─► pass 1 ──ok──────────────┐
//! │                                        │ rolled back          │
//! │                                        ▼                      │
//! │                                     pass 2 (prefixes) ─fail─► requeue
//! │                                        │ ok                   │
//! │                                        ▼                      ▼
//! └──────────── more queued? ◄──── commit_processed(n) + requeue ◄┘
//!
//! release lock on every exit path
//! ```
//!
//! Before each pass is finished the processor re-checks that it still owns
//! the lock. If another drainer took over in the meantime the open
//! transaction is rolled back and the run fails with `LockLost`, leaving the
//! peeked batches in the queue.

use crate::backend::QueueBackend;
use crate::observability::{
    BATCHES_RETRIED, DRAIN_RUNS, ENTRIES_DISCARDED, EVENTS_DROPPED, EVENTS_PERSISTED,
    QUEUE_DEPTH,
};
use crate::queue::handler::{BatchHandler, HandlerState};
use crate::queue::lock::DistributedLock;
use crate::queue::tracking_queue::Queue;
use crate::sink::BatchSink;
use crate::tracking::EventBatch;
use crate::utils::config::{LockConfig, TrackingConfig};
use crate::utils::errors::{QueueError, Result};
use metrics::{counter, gauge};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type IterationCallback = Box<dyn Fn(usize) + Send + Sync>;

/// How a drain run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Statistics recording is switched off; nothing was touched
    Disabled,

    /// Fewer batches queued than the threshold
    BelowThreshold,

    /// Another drainer holds the lock
    Locked,

    /// Drained until the queue fell below the threshold
    Drained,

    /// Stopped between two iterations on request
    Cancelled,
}

/// Summary of one [`Processor::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub outcome: DrainOutcome,

    /// Number of peek/replay/commit iterations
    pub iterations: usize,

    /// Events persisted by committed passes
    pub events_persisted: usize,

    /// Queued batches whose events ended up in a committed pass
    pub batches_committed: usize,

    /// Batches pushed back to the tail after failing twice
    pub batches_requeued: usize,

    /// Events discarded by truncate-at-first-failure
    pub events_dropped: usize,

    /// Queue entries that no longer decoded and were trimmed unreplayed
    pub entries_discarded: usize,
}

impl DrainReport {
    fn new(outcome: DrainOutcome) -> Self {
        Self {
            outcome,
            iterations: 0,
            events_persisted: 0,
            batches_committed: 0,
            batches_requeued: 0,
            events_dropped: 0,
            entries_discarded: 0,
        }
    }
}

/// Drains the queue into a sink while holding the drain lock
pub struct Processor {
    queue: Queue,
    lock: DistributedLock,
    handler: BatchHandler,
    lock_config: LockConfig,
    record_statistics: bool,
    on_iteration: Option<IterationCallback>,
}

impl Processor {
    pub fn new(
        queue: Queue,
        lock: DistributedLock,
        sink: Arc<dyn BatchSink>,
        config: &TrackingConfig,
    ) -> Self {
        Self {
            queue,
            lock,
            handler: BatchHandler::new(sink),
            lock_config: config.lock.clone(),
            record_statistics: config.tracker.record_statistics,
            on_iteration: None,
        }
    }

    /// Build the queue and lock on `backend` from the configuration
    pub fn from_config(
        backend: Arc<dyn QueueBackend>,
        sink: Arc<dyn BatchSink>,
        config: &TrackingConfig,
    ) -> Self {
        let queue = Queue::new(backend.clone(), &config.queue);
        let lock = DistributedLock::new(backend, config.queue.lock_key.clone());
        Self::new(queue, lock, sink, config)
    }

    /// Call `callback` with the queue depth at the start of every iteration
    pub fn with_iteration_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_iteration = Some(Box::new(callback));
        self
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Drain once, until the queue falls below the threshold
    pub async fn run(&mut self) -> Result<DrainReport> {
        self.run_until_cancelled(&CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), stopping between iterations once `cancel`
    /// fires
    pub async fn run_until_cancelled(&mut self, cancel: &CancellationToken) -> Result<DrainReport> {
        if !self.record_statistics {
            debug!("Statistics recording disabled, leaving queue untouched");
            return Ok(DrainReport::new(DrainOutcome::Disabled));
        }

        if !self.queue.should_drain().await? {
            return Ok(DrainReport::new(DrainOutcome::BelowThreshold));
        }

        if !self.lock.acquire(self.lock_config.acquire_ttl()).await? {
            debug!("Queue is already being processed elsewhere");
            return Ok(DrainReport::new(DrainOutcome::Locked));
        }

        counter!(DRAIN_RUNS).increment(1);
        info!(
            "Starting to process {} queued batches",
            self.queue.size().await.unwrap_or_default()
        );

        let mut report = DrainReport::new(DrainOutcome::Drained);
        let result = self.drain(cancel, &mut report).await;

        if result.is_err() {
            self.handler.abort().await;
        }

        if let Err(e) = self.lock.release().await {
            warn!("Failed to release queue lock: {}", e);
        }

        result?;

        info!(
            iterations = report.iterations,
            persisted = report.events_persisted,
            requeued = report.batches_requeued,
            dropped = report.events_dropped,
            discarded = report.entries_discarded,
            "Queue processed"
        );

        Ok(report)
    }

    async fn drain(&mut self, cancel: &CancellationToken, report: &mut DrainReport) -> Result<()> {
        while self.queue.should_drain().await? && self.lock.is_held_by_me().await? {
            if cancel.is_cancelled() {
                info!("Queue processing cancelled");
                report.outcome = DrainOutcome::Cancelled;
                break;
            }

            let depth = self.queue.size().await?;
            gauge!(QUEUE_DEPTH).set(depth as f64);
            if let Some(callback) = &self.on_iteration {
                callback(depth);
            }

            let batches = self.queue.peek_batches(self.queue.threshold()).await?;
            if batches.is_empty() {
                break;
            }

            let num_events = batches.iter().map(EventBatch::len).sum();
            if !self
                .lock
                .extend(self.lock_config.ttl_for_events(num_events))
                .await?
            {
                return Err(QueueError::LockLost);
            }

            // Enqueue never stores empty batches, so these are entries that
            // failed to decode
            let discarded = batches.iter().filter(|b| b.is_empty()).count();
            if discarded > 0 {
                warn!("Discarding {} undecodable queue entries", discarded);
            }

            let persisted_before = self.handler.logged_events();
            let dropped_before = self.handler.dropped_events();

            let requeue = self.process_batches(&batches, report).await?;

            self.queue.commit_processed(batches.len()).await?;
            self.queue.enqueue_all(&requeue).await?;

            let persisted = self.handler.logged_events() - persisted_before;
            let dropped = self.handler.dropped_events() - dropped_before;

            report.iterations += 1;
            report.events_persisted += persisted;
            report.events_dropped += dropped;
            report.batches_requeued += requeue.len();
            report.entries_discarded += discarded;

            counter!(EVENTS_PERSISTED).increment(persisted as u64);
            counter!(EVENTS_DROPPED).increment(dropped as u64);
            counter!(ENTRIES_DISCARDED).increment(discarded as u64);
        }

        Ok(())
    }

    /// First pass over `batches`, plus one retry pass over the surviving
    /// prefixes if the first one rolled back. Returns what to requeue.
    async fn process_batches(
        &mut self,
        batches: &[EventBatch],
        report: &mut DrainReport,
    ) -> Result<Vec<EventBatch>> {
        let to_retry = self.replay_pass(batches).await?;
        if self.handler.state() == HandlerState::Committed {
            report.batches_committed += batches.iter().filter(|b| !b.is_empty()).count();
            return Ok(Vec::new());
        }

        if to_retry.is_empty() {
            return Ok(Vec::new());
        }

        counter!(BATCHES_RETRIED).increment(to_retry.len() as u64);
        debug!("Retrying {} batches without their failed events", to_retry.len());

        let requeue = self.replay_pass(&to_retry).await?;
        if self.handler.state() == HandlerState::Committed {
            report.batches_committed += to_retry.len();
            return Ok(Vec::new());
        }

        warn!("{} batches failed twice, deferring to a later run", requeue.len());

        Ok(requeue)
    }

    async fn replay_pass(&mut self, batches: &[EventBatch]) -> Result<Vec<EventBatch>> {
        self.handler.begin().await?;

        for batch in batches {
            match self.handler.replay(batch).await {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => self.handler.fail(batch.clone(), &e),
                Err(e) => return Err(e),
            }
        }

        if !self.lock.is_held_by_me().await? {
            warn!("Lost queue lock while processing, rolling back");
            self.handler.force_rollback();
            self.handler.finish().await?;
            return Err(QueueError::LockLost);
        }

        self.handler.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::sink::MemorySink;
    use crate::tracking::{Environment, Event};
    use crate::utils::errors::PersistError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(threshold: usize) -> TrackingConfig {
        let mut config = TrackingConfig::default();
        config.queue.enabled = true;
        config.queue.batch_size = threshold;
        config
    }

    fn batch(urls: &[&str]) -> EventBatch {
        let events = urls
            .iter()
            .map(|url| Event::new([("idsite", "1"), ("url", *url)]))
            .collect();
        EventBatch::new(events, Environment::new())
    }

    async fn fill(processor: &Processor, n: usize) {
        for i in 0..n {
            let url = format!("u{}", i);
            processor.queue().enqueue(&batch(&[url.as_str()])).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_below_threshold() {
        let sink = Arc::new(MemorySink::new());
        let mut processor =
            Processor::from_config(Arc::new(MemoryBackend::new()), sink.clone(), &config(3));
        fill(&processor, 2).await;

        let report = processor.run().await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::BelowThreshold);
        assert_eq!(sink.persist_calls(), 0);
    }

    #[tokio::test]
    async fn test_drains_whole_slices_only() {
        let sink = Arc::new(MemorySink::new());
        let mut processor =
            Processor::from_config(Arc::new(MemoryBackend::new()), sink.clone(), &config(3));
        fill(&processor, 10).await;

        let report = processor.run().await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.iterations, 3);
        assert_eq!(report.events_persisted, 9);
        assert_eq!(report.batches_committed, 9);
        assert_eq!(sink.committed_count(), 9);
        assert_eq!(processor.queue().size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_locked_elsewhere() {
        let backend = Arc::new(MemoryBackend::new());
        let cfg = config(1);
        let mut other = DistributedLock::new(backend.clone(), cfg.queue.lock_key.clone());
        assert!(other.acquire(cfg.lock.acquire_ttl()).await.unwrap());

        let sink = Arc::new(MemorySink::new());
        let mut processor = Processor::from_config(backend, sink.clone(), &cfg);
        fill(&processor, 2).await;

        let report = processor.run().await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Locked);
        assert_eq!(sink.persist_calls(), 0);
        assert!(other.is_held_by_me().await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_failure_retries_prefixes() {
        let sink = Arc::new(MemorySink::new().with_failure(|event| {
            (event.param("url").and_then(|v| v.as_str()) == Some("bad"))
                .then(|| PersistError::Invalid("bad url".to_string()))
        }));
        let mut processor =
            Processor::from_config(Arc::new(MemoryBackend::new()), sink.clone(), &config(2));
        processor.queue().enqueue(&batch(&["a", "b", "bad", "c"])).await.unwrap();
        processor.queue().enqueue(&batch(&["d"])).await.unwrap();

        let report = processor.run().await.unwrap();

        assert_eq!(report.events_persisted, 3);
        assert_eq!(report.events_dropped, 2);
        assert_eq!(report.batches_requeued, 0);
        assert_eq!(sink.rollbacks(), 1);
        assert_eq!(sink.commits(), 1);

        let urls: Vec<_> = sink
            .committed()
            .iter()
            .map(|p| p.event.param("url").unwrap().to_string())
            .collect();
        assert_eq!(urls, vec!["a", "b", "d"]);
        assert_eq!(processor.queue().size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_twice_failing_batches_are_requeued() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        // "a" is accepted the first time only
        let sink = Arc::new(MemorySink::new().with_failure(move |event| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let url = event.param("url").and_then(|v| v.as_str());
            (url == Some("bad") || (n >= 3 && url == Some("a")))
                .then(|| PersistError::Invalid("rejected".to_string()))
        }));
        let mut processor =
            Processor::from_config(Arc::new(MemoryBackend::new()), sink.clone(), &config(1));
        processor.queue().enqueue(&batch(&["x", "a", "bad"])).await.unwrap();

        let report = processor.run().await.unwrap();

        // iteration 1, pass 1: x, a ok, bad rejected -> retry [x, a]
        // iteration 1, pass 2: x ok, a rejected -> requeue [x]
        // iteration 2: x committed
        assert_eq!(report.iterations, 2);
        assert_eq!(report.batches_requeued, 1);
        assert_eq!(report.events_persisted, 1);
        assert_eq!(report.events_dropped, 2);
        assert_eq!(sink.rollbacks(), 2);

        let committed = sink.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].event.param("url").unwrap().to_string(), "x");
        assert_eq!(processor.queue().size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_statistics_disabled() {
        let mut cfg = config(1);
        cfg.tracker.record_statistics = false;
        let sink = Arc::new(MemorySink::new());
        let mut processor =
            Processor::from_config(Arc::new(MemoryBackend::new()), sink.clone(), &cfg);
        fill(&processor, 3).await;

        let report = processor.run().await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Disabled);
        assert_eq!(sink.persist_calls(), 0);
        assert_eq!(processor.queue().size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_iteration() {
        let sink = Arc::new(MemorySink::new());
        let backend = Arc::new(MemoryBackend::new());
        let cfg = config(1);
        let mut processor = Processor::from_config(backend.clone(), sink.clone(), &cfg);
        fill(&processor, 2).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = processor.run_until_cancelled(&cancel).await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Cancelled);
        assert_eq!(report.iterations, 0);
        assert_eq!(processor.queue().size().await.unwrap(), 2);
        assert!(backend.get(&cfg.queue.lock_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_error_aborts_and_releases_lock() {
        let sink = Arc::new(
            MemorySink::new().with_failure(|_| Some(PersistError::Storage("db down".to_string()))),
        );
        let backend = Arc::new(MemoryBackend::new());
        let cfg = config(2);
        let mut processor = Processor::from_config(backend.clone(), sink.clone(), &cfg);
        fill(&processor, 2).await;

        let err = processor.run().await.unwrap_err();

        assert!(matches!(err, QueueError::Persistence(_)));
        assert_eq!(processor.queue().size().await.unwrap(), 2);
        assert!(!sink.has_open_transaction());
        assert!(backend.get(&cfg.queue.lock_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_not_counted_as_committed() {
        let backend = Arc::new(MemoryBackend::new());
        let cfg = config(2);
        let sink = Arc::new(MemorySink::new());
        let mut processor = Processor::from_config(backend.clone(), sink.clone(), &cfg);

        let stale = r#"{"events":[{"params":{"gt_ms":null}}]}"#.to_string();
        backend.rpush(&cfg.queue.list_key, &[stale]).await.unwrap();
        fill(&processor, 1).await;

        let report = processor.run().await.unwrap();

        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.entries_discarded, 1);
        assert_eq!(report.batches_committed, 1);
        assert_eq!(report.events_persisted, 1);
        assert_eq!(sink.committed_count(), 1);
        assert_eq!(processor.queue().size().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_is_extended_for_the_pulled_slice() {
        let backend = Arc::new(MemoryBackend::new());
        let mut cfg = config(2);
        cfg.lock.acquire_ttl_secs = 1;
        cfg.lock.ttl_floor_secs = 5;
        cfg.lock.ttl_per_event_ms = 1_000;
        let expected = cfg.lock.ttl_for_events(3);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = seen.clone();
        let observed = backend.clone();
        let lock_key = cfg.queue.lock_key.clone();
        let sink = Arc::new(MemorySink::new().with_failure(move |_| {
            record.lock().push(observed.ttl(&lock_key));
            None
        }));

        let mut processor = Processor::from_config(backend.clone(), sink.clone(), &cfg);
        processor.queue().enqueue(&batch(&["a", "b"])).await.unwrap();
        processor.queue().enqueue(&batch(&["c"])).await.unwrap();

        let report = processor.run().await.unwrap();

        // Time is paused, so every replay sees exactly the extended TTL
        assert_eq!(expected, Duration::from_secs(8));
        assert_eq!(*seen.lock(), vec![Some(expected); 3]);
        assert!(expected > cfg.lock.acquire_ttl());
        assert_eq!(report.events_persisted, 3);
        assert_eq!(sink.commits(), 1);
        assert!(backend.get(&cfg.queue.lock_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_iteration_callback_sees_depth() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = seen.clone();
        let sink = Arc::new(MemorySink::new());
        let mut processor =
            Processor::from_config(Arc::new(MemoryBackend::new()), sink, &config(2))
                .with_iteration_callback(move |depth| record.lock().push(depth));
        fill(&processor, 5).await;

        processor.run().await.unwrap();

        assert_eq!(*seen.lock(), vec![5, 3]);
    }
}

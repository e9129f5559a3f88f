// src/queue/handler.rs
//! Transactional replay of drained batches
//!
//! One handler pass wraps a whole slice of batches in a single sink
//! transaction:
//!
//! ```text
//! Idle ─begin()─► TransactionOpen ─replay()/fail()─► ... ─finish()─┬─► Committed
//!                                                                   └─► RolledBack
//! ```
//!
//! A batch whose event `k` is rejected keeps only its first `k` events
//! (truncate-at-first-failure). Any rejection rolls back the whole pass and
//! hands the surviving prefixes back to the caller for a second attempt.

use crate::sink::{BatchSink, EventContext, TransactionId};
use crate::tracking::EventBatch;
use crate::utils::errors::{QueueError, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Where the handler is in its begin/finish cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    TransactionOpen,
    Committed,
    RolledBack,
}

/// Replays batches against a [`BatchSink`] inside one transaction
pub struct BatchHandler {
    sink: Arc<dyn BatchSink>,
    state: HandlerState,
    transaction: Option<TransactionId>,
    has_error: bool,

    /// Batches to replay again if this pass is rolled back
    to_retry: Vec<EventBatch>,

    /// Events of the current batch accepted by the sink so far
    replayed: usize,

    /// Events persisted over the handler's lifetime, committed passes only
    logged_events: usize,
    logged_at_begin: usize,

    dropped_events: usize,
}

impl BatchHandler {
    pub fn new(sink: Arc<dyn BatchSink>) -> Self {
        Self {
            sink,
            state: HandlerState::Idle,
            transaction: None,
            has_error: false,
            to_retry: Vec::new(),
            replayed: 0,
            logged_events: 0,
            logged_at_begin: 0,
            dropped_events: 0,
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Events persisted by committed passes
    pub fn logged_events(&self) -> usize {
        self.logged_events
    }

    /// Events discarded by truncation
    pub fn dropped_events(&self) -> usize {
        self.dropped_events
    }

    /// Open a transaction and reset per-pass bookkeeping
    pub async fn begin(&mut self) -> Result<()> {
        if let Some(tx) = self.transaction {
            return Err(QueueError::Persistence(format!(
                "Transaction {} is still open",
                tx
            )));
        }

        let tx = self.sink.begin_transaction().await?;

        self.transaction = Some(tx);
        self.state = HandlerState::TransactionOpen;
        self.has_error = false;
        self.to_retry.clear();
        self.replayed = 0;
        self.logged_at_begin = self.logged_events;

        Ok(())
    }

    /// Replay every event of `batch` in order
    ///
    /// Returns `QueueError::Domain` when the sink rejects an event; the
    /// caller then hands the batch to [`fail`](Self::fail). Any other error
    /// means the sink is failing and the pass cannot continue.
    pub async fn replay(&mut self, batch: &EventBatch) -> Result<()> {
        let tx = self.open_transaction()?;

        self.replayed = 0;
        for event in batch.events() {
            let context = EventContext {
                environment: batch.environment(),
                token_auth: batch.token_for(event),
            };

            self.sink.persist(tx, event, context).await?;

            self.replayed += 1;
            self.logged_events += 1;
        }

        self.to_retry.push(batch.clone());

        Ok(())
    }

    /// Record that `batch` failed after the events counted by the last
    /// [`replay`](Self::replay)
    pub fn fail(&mut self, mut batch: EventBatch, error: &QueueError) {
        self.has_error = true;

        let kept = self.replayed.min(batch.len());
        let dropped = batch.len() - kept;
        self.dropped_events += dropped;

        warn!(kept, dropped, "Event {} of batch rejected: {}", kept, error);

        if kept > 0 {
            batch.truncate(kept);
            self.to_retry.push(batch);
        }
    }

    /// Make the next [`finish`](Self::finish) roll back
    pub fn force_rollback(&mut self) {
        self.has_error = true;
    }

    /// Commit, or roll back and return the batches worth another attempt
    pub async fn finish(&mut self) -> Result<Vec<EventBatch>> {
        let tx = self.open_transaction()?;
        self.transaction = None;

        if self.has_error {
            self.logged_events = self.logged_at_begin;
            self.state = HandlerState::RolledBack;
            self.sink.rollback(tx).await?;

            debug!("Rolled back pass, {} batches to retry", self.to_retry.len());

            return Ok(std::mem::take(&mut self.to_retry));
        }

        self.sink.commit(tx).await?;
        self.state = HandlerState::Committed;
        self.to_retry.clear();

        Ok(Vec::new())
    }

    /// Roll back an open transaction after a fatal error, ignoring failures
    pub async fn abort(&mut self) {
        let Some(tx) = self.transaction.take() else {
            return;
        };

        self.logged_events = self.logged_at_begin;
        self.to_retry.clear();
        self.state = HandlerState::RolledBack;

        if let Err(e) = self.sink.rollback(tx).await {
            warn!("Failed to roll back {} after error: {}", tx, e);
        }
    }

    fn open_transaction(&self) -> Result<TransactionId> {
        self.transaction
            .ok_or_else(|| QueueError::Persistence("No open transaction".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::tracking::{Environment, Event};
    use crate::utils::errors::PersistError;

    fn batch(urls: &[&str]) -> EventBatch {
        let events = urls
            .iter()
            .map(|url| Event::new([("idsite", "1"), ("url", *url)]))
            .collect();
        EventBatch::new(events, Environment::new())
    }

    fn failing_on(url: &'static str) -> Arc<MemorySink> {
        Arc::new(MemorySink::new().with_failure(move |event| {
            (event.param("url").and_then(|v| v.as_str()) == Some(url))
                .then(|| PersistError::Invalid(format!("rejected {}", url)))
        }))
    }

    async fn replay_or_fail(handler: &mut BatchHandler, batch: &EventBatch) {
        match handler.replay(batch).await {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => handler.fail(batch.clone(), &e),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[tokio::test]
    async fn test_clean_pass_commits() {
        let sink = Arc::new(MemorySink::new());
        let mut handler = BatchHandler::new(sink.clone());

        handler.begin().await.unwrap();
        replay_or_fail(&mut handler, &batch(&["a", "b"])).await;
        replay_or_fail(&mut handler, &batch(&["c"])).await;
        let retry = handler.finish().await.unwrap();

        assert!(retry.is_empty());
        assert_eq!(handler.state(), HandlerState::Committed);
        assert_eq!(handler.logged_events(), 3);
        assert_eq!(sink.committed_count(), 3);
    }

    #[tokio::test]
    async fn test_failure_truncates_and_rolls_back() {
        let sink = failing_on("e4");
        let mut handler = BatchHandler::new(sink.clone());
        let failing = batch(&["e0", "e1", "e2", "e3", "e4", "e5", "e6"]);
        let clean = batch(&["x"]);

        handler.begin().await.unwrap();
        replay_or_fail(&mut handler, &clean).await;
        replay_or_fail(&mut handler, &failing).await;
        let retry = handler.finish().await.unwrap();

        assert_eq!(handler.state(), HandlerState::RolledBack);
        assert_eq!(retry.len(), 2);
        assert_eq!(retry[0], clean);
        assert_eq!(retry[1].len(), 4);
        assert_eq!(retry[1].events(), &failing.events()[..4]);
        assert_eq!(handler.dropped_events(), 3);

        assert_eq!(sink.committed_count(), 0);
        assert_eq!(sink.rollbacks(), 1);
        assert_eq!(handler.logged_events(), 0);
    }

    #[tokio::test]
    async fn test_failure_on_first_event_drops_batch() {
        let sink = failing_on("bad");
        let mut handler = BatchHandler::new(sink);

        handler.begin().await.unwrap();
        replay_or_fail(&mut handler, &batch(&["bad", "ok"])).await;
        let retry = handler.finish().await.unwrap();

        assert!(retry.is_empty());
        assert_eq!(handler.state(), HandlerState::RolledBack);
        assert_eq!(handler.dropped_events(), 2);
    }

    #[tokio::test]
    async fn test_storage_error_is_not_recoverable() {
        let sink = Arc::new(
            MemorySink::new().with_failure(|_| Some(PersistError::Storage("down".to_string()))),
        );
        let mut handler = BatchHandler::new(sink.clone());

        handler.begin().await.unwrap();
        let err = handler.replay(&batch(&["a"])).await.unwrap_err();
        assert!(matches!(err, QueueError::Persistence(_)));

        handler.abort().await;
        assert!(!sink.has_open_transaction());
        assert_eq!(handler.state(), HandlerState::RolledBack);
    }

    #[tokio::test]
    async fn test_force_rollback() {
        let sink = Arc::new(MemorySink::new());
        let mut handler = BatchHandler::new(sink.clone());

        handler.begin().await.unwrap();
        replay_or_fail(&mut handler, &batch(&["a"])).await;
        handler.force_rollback();
        handler.finish().await.unwrap();

        assert_eq!(sink.committed_count(), 0);
        assert_eq!(handler.logged_events(), 0);
    }

    #[tokio::test]
    async fn test_counter_survives_committed_passes() {
        let sink = failing_on("bad");
        let mut handler = BatchHandler::new(sink);

        handler.begin().await.unwrap();
        replay_or_fail(&mut handler, &batch(&["a", "b"])).await;
        handler.finish().await.unwrap();

        handler.begin().await.unwrap();
        replay_or_fail(&mut handler, &batch(&["c", "bad"])).await;
        handler.finish().await.unwrap();

        assert_eq!(handler.logged_events(), 2);
    }

    #[tokio::test]
    async fn test_replay_without_transaction() {
        let mut handler = BatchHandler::new(Arc::new(MemorySink::new()));

        assert!(handler.replay(&batch(&["a"])).await.is_err());
        assert!(handler.finish().await.is_err());
        assert_eq!(handler.state(), HandlerState::Idle);
    }
}

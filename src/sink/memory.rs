// src/sink/memory.rs
//! In-memory sink with real transaction semantics
//!
//! Events persisted inside a transaction are staged and only become visible
//! in [`MemorySink::committed`] after a commit. A failure hook can reject
//! individual events or simulate a storage outage.

use crate::sink::{validate_event, BatchSink, EventContext, TransactionId};
use crate::tracking::{Environment, Event};
use crate::utils::errors::{PersistError, QueueError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

type FailureHook = Box<dyn Fn(&Event) -> Option<PersistError> + Send + Sync>;

/// Event as it was handed to the sink
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEvent {
    pub event: Event,
    pub environment: Environment,
    pub token_auth: Option<String>,
}

#[derive(Debug, Default)]
struct SinkState {
    open: Option<(TransactionId, Vec<PersistedEvent>)>,
    committed: Vec<PersistedEvent>,
    persist_calls: usize,
    commits: usize,
    rollbacks: usize,
}

/// Sink keeping committed events in memory
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
    failure: Option<FailureHook>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consult `hook` before persisting each event; `Some(err)` fails it
    pub fn with_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Event) -> Option<PersistError> + Send + Sync + 'static,
    {
        self.failure = Some(Box::new(hook));
        self
    }

    /// Events that made it through a commit, in order
    pub fn committed(&self) -> Vec<PersistedEvent> {
        self.state.lock().committed.clone()
    }

    pub fn committed_count(&self) -> usize {
        self.state.lock().committed.len()
    }

    /// Number of `persist` calls, including failed ones
    pub fn persist_calls(&self) -> usize {
        self.state.lock().persist_calls
    }

    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn has_open_transaction(&self) -> bool {
        self.state.lock().open.is_some()
    }

    fn take_open(&self, tx: TransactionId) -> Result<Vec<PersistedEvent>> {
        let mut state = self.state.lock();
        match state.open.take() {
            Some((open, staged)) if open == tx => Ok(staged),
            other => {
                state.open = other;
                Err(QueueError::Persistence(format!("Unknown transaction {}", tx)))
            }
        }
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn begin_transaction(&self) -> Result<TransactionId> {
        let mut state = self.state.lock();
        if let Some((open, _)) = &state.open {
            return Err(QueueError::Persistence(format!(
                "Transaction {} is still open",
                open
            )));
        }

        let tx = TransactionId::new();
        state.open = Some((tx, Vec::new()));
        Ok(tx)
    }

    async fn persist(
        &self,
        tx: TransactionId,
        event: &Event,
        context: EventContext<'_>,
    ) -> std::result::Result<(), PersistError> {
        self.state.lock().persist_calls += 1;

        if let Some(err) = self.failure.as_ref().and_then(|hook| hook(event)) {
            return Err(err);
        }
        validate_event(event)?;

        let mut state = self.state.lock();
        match state.open.as_mut() {
            Some((open, staged)) if *open == tx => {
                staged.push(PersistedEvent {
                    event: event.clone(),
                    environment: context.environment.clone(),
                    token_auth: context.token_auth.map(str::to_string),
                });
                Ok(())
            }
            _ => Err(PersistError::Storage(format!("Unknown transaction {}", tx))),
        }
    }

    async fn commit(&self, tx: TransactionId) -> Result<()> {
        let staged = self.take_open(tx)?;
        let mut state = self.state.lock();
        state.committed.extend(staged);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&self, tx: TransactionId) -> Result<()> {
        self.take_open(tx)?;
        self.state.lock().rollbacks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(env: &Environment) -> EventContext<'_> {
        EventContext {
            environment: env,
            token_auth: Some("token"),
        }
    }

    #[tokio::test]
    async fn test_commit_makes_events_visible() {
        let sink = MemorySink::new();
        let env = Environment::new().with_client_ip("1.2.3.4");

        let tx = sink.begin_transaction().await.unwrap();
        sink.persist(tx, &Event::new([("idsite", "1")]), context(&env))
            .await
            .unwrap();
        assert_eq!(sink.committed_count(), 0);

        sink.commit(tx).await.unwrap();

        let committed = sink.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].environment.client_ip(), Some("1.2.3.4"));
        assert_eq!(committed[0].token_auth.as_deref(), Some("token"));
        assert_eq!(sink.commits(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_events() {
        let sink = MemorySink::new();
        let env = Environment::new();

        let tx = sink.begin_transaction().await.unwrap();
        sink.persist(tx, &Event::new([("idsite", "1")]), context(&env))
            .await
            .unwrap();
        sink.rollback(tx).await.unwrap();

        assert_eq!(sink.committed_count(), 0);
        assert_eq!(sink.rollbacks(), 1);
        assert!(!sink.has_open_transaction());
    }

    #[tokio::test]
    async fn test_single_open_transaction() {
        let sink = MemorySink::new();
        let tx = sink.begin_transaction().await.unwrap();

        assert!(sink.begin_transaction().await.is_err());
        assert!(sink.commit(TransactionId::new()).await.is_err());
        assert!(sink.has_open_transaction());

        sink.commit(tx).await.unwrap();
        assert!(sink.begin_transaction().await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_hook() {
        let sink = MemorySink::new().with_failure(|event| {
            (event.param("url").and_then(|v| v.as_str()) == Some("bad"))
                .then(|| PersistError::Invalid("bad url".to_string()))
        });
        let env = Environment::new();
        let tx = sink.begin_transaction().await.unwrap();

        let ok = Event::new([("idsite", "1"), ("url", "good")]);
        let bad = Event::new([("idsite", "1"), ("url", "bad")]);

        assert!(sink.persist(tx, &ok, context(&env)).await.is_ok());
        assert_eq!(
            sink.persist(tx, &bad, context(&env)).await,
            Err(PersistError::Invalid("bad url".to_string()))
        );
        assert_eq!(sink.persist_calls(), 2);
    }
}

// src/sink/mod.rs
//! Persistence engines that replayed events are written to
//!
//! The processor only needs four operations from a persistence engine:
//! open a transaction, persist one event inside it, commit, roll back.
//! Which engine is used is decided once at startup from [`SinkConfig`].
//!
//! - **SqliteSink**: writes one row per event into a SQLite database
//! - **LogSink**: logs events instead of storing them (dry runs)
//! - **MemorySink**: keeps events in memory, with failure injection

pub mod log;
pub mod memory;
pub mod sqlite;

use crate::tracking::{Environment, Event};
use crate::utils::config::{SinkConfig, SinkKind};
use crate::utils::errors::{PersistError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use ulid::Ulid;

// Re-export commonly used types
pub use self::log::LogSink;
pub use memory::MemorySink;
pub use sqlite::SqliteSink;

/// Opaque handle of an open sink transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(Ulid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx_{}", self.0)
    }
}

/// Request context an event is persisted under
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    pub environment: &'a Environment,
    pub token_auth: Option<&'a str>,
}

/// Transactional persistence engine
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Open a transaction; only one may be open at a time
    async fn begin_transaction(&self) -> Result<TransactionId>;

    /// Persist one event inside `tx`
    ///
    /// `PersistError::Invalid` rejects this event only; `PersistError::Storage`
    /// means the engine itself is failing.
    async fn persist(
        &self,
        tx: TransactionId,
        event: &Event,
        context: EventContext<'_>,
    ) -> std::result::Result<(), PersistError>;

    async fn commit(&self, tx: TransactionId) -> Result<()>;

    async fn rollback(&self, tx: TransactionId) -> Result<()>;
}

/// Reject events that cannot be attributed to a site
pub(crate) fn validate_event(event: &Event) -> std::result::Result<i64, PersistError> {
    event.site_id().ok_or_else(|| {
        PersistError::Invalid(match event.param(crate::tracking::SITE_ID_PARAM) {
            Some(value) => format!("Invalid idsite '{}'", value),
            None => "Missing idsite".to_string(),
        })
    })
}

/// Build the sink selected in the configuration
pub async fn build_sink(config: &SinkConfig) -> Result<Arc<dyn BatchSink>> {
    match config.kind {
        SinkKind::Sqlite => Ok(Arc::new(SqliteSink::open(&config.path).await?)),
        SinkKind::Log => Ok(Arc::new(LogSink::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_event() {
        assert_eq!(validate_event(&Event::new([("idsite", "5")])), Ok(5));

        let err = validate_event(&Event::new([("idsite", "-1")])).unwrap_err();
        assert_eq!(err, PersistError::Invalid("Invalid idsite '-1'".to_string()));

        let err = validate_event(&Event::new([("url", "http://a")])).unwrap_err();
        assert_eq!(err, PersistError::Invalid("Missing idsite".to_string()));
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        assert_ne!(TransactionId::new(), TransactionId::new());
        assert!(TransactionId::new().to_string().starts_with("tx_"));
    }
}

// src/sink/sqlite.rs
//! SQLite persistence engine
//!
//! Writes one `tracked_events` row per event. A transaction is an explicit
//! `BEGIN IMMEDIATE` ... `COMMIT`/`ROLLBACK` on the sink's connection, so
//! the processor can roll back a whole drained batch at once.

use crate::sink::{validate_event, BatchSink, EventContext, TransactionId};
use crate::tracking::{Event, URL_PARAM};
use crate::utils::errors::{PersistError, QueueError, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

struct SinkConnection {
    conn: Connection,
    open: Option<TransactionId>,
}

/// Persists events into a SQLite database
pub struct SqliteSink {
    db: Arc<Mutex<SinkConnection>>,
}

impl SqliteSink {
    /// Open (and initialise) the tracking database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                QueueError::Persistence(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            QueueError::Persistence(format!("Failed to open database: {}", e))
        })?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(|e| {
            QueueError::Persistence(format!("Failed to set busy timeout: {}", e))
        })?;

        let sink = Self {
            db: Arc::new(Mutex::new(SinkConnection { conn, open: None })),
        };

        sink.init_schema().await?;

        info!("Tracking sink initialized at {:?}", path);

        Ok(sink)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;

        db.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS tracked_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    site_id INTEGER NOT NULL,
                    url TEXT,
                    params TEXT NOT NULL,
                    token_auth TEXT,
                    client_ip TEXT,
                    user_agent TEXT,
                    tracked_at INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tracked_events_site ON tracked_events(site_id);
                "#,
            )
            .map_err(|e| QueueError::Persistence(format!("Schema creation failed: {}", e)))?;

        Ok(())
    }

    /// Number of stored events
    pub async fn count_events(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM tracked_events", [], |row| row.get(0))
            .map_err(|e| QueueError::Persistence(format!("Failed to count events: {}", e)))?;

        Ok(count as u64)
    }

    /// Stored events of one site, oldest first
    pub async fn events_for_site(&self, site_id: i64) -> Result<Vec<StoredEvent>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .conn
            .prepare(
                "SELECT site_id, url, client_ip, user_agent, tracked_at FROM tracked_events WHERE site_id = ?1 ORDER BY id",
            )
            .map_err(|e| QueueError::Persistence(format!("Query preparation failed: {}", e)))?;

        let events = stmt
            .query_map(params![site_id], |row| {
                Ok(StoredEvent {
                    site_id: row.get(0)?,
                    url: row.get(1)?,
                    client_ip: row.get(2)?,
                    user_agent: row.get(3)?,
                    tracked_at: row.get(4)?,
                })
            })
            .map_err(|e| QueueError::Persistence(format!("Query execution failed: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                QueueError::Persistence(format!("Result collection failed: {}", e))
            })?;

        Ok(events)
    }
}

#[async_trait]
impl BatchSink for SqliteSink {
    async fn begin_transaction(&self) -> Result<TransactionId> {
        let mut db = self.db.lock().await;
        if let Some(open) = db.open {
            return Err(QueueError::Persistence(format!(
                "Transaction {} is still open",
                open
            )));
        }

        db.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| QueueError::Persistence(format!("Failed to begin transaction: {}", e)))?;

        let tx = TransactionId::new();
        db.open = Some(tx);

        debug!("Opened sink transaction {}", tx);

        Ok(tx)
    }

    async fn persist(
        &self,
        tx: TransactionId,
        event: &Event,
        context: EventContext<'_>,
    ) -> std::result::Result<(), PersistError> {
        let site_id = validate_event(event)?;

        let params_json = serde_json::to_string(event.params())
            .map_err(|e| PersistError::Invalid(format!("Unencodable parameters: {}", e)))?;
        let url = event.param(URL_PARAM).map(ToString::to_string);

        let db = self.db.lock().await;
        if db.open != Some(tx) {
            return Err(PersistError::Storage(format!("Unknown transaction {}", tx)));
        }

        db.conn
            .execute(
                r#"
                INSERT INTO tracked_events
                    (site_id, url, params, token_auth, client_ip, user_agent, tracked_at, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    site_id,
                    url,
                    params_json,
                    context.token_auth,
                    context.environment.client_ip(),
                    context.environment.user_agent(),
                    event.captured_at().timestamp_millis(),
                    chrono::Utc::now().timestamp_millis(),
                ],
            )
            .map_err(|e| PersistError::Storage(format!("Failed to insert event: {}", e)))?;

        Ok(())
    }

    async fn commit(&self, tx: TransactionId) -> Result<()> {
        let mut db = self.db.lock().await;
        if db.open != Some(tx) {
            return Err(QueueError::Persistence(format!("Unknown transaction {}", tx)));
        }

        db.conn
            .execute_batch("COMMIT")
            .map_err(|e| QueueError::Persistence(format!("Failed to commit: {}", e)))?;
        db.open = None;

        debug!("Committed sink transaction {}", tx);

        Ok(())
    }

    async fn rollback(&self, tx: TransactionId) -> Result<()> {
        let mut db = self.db.lock().await;
        if db.open != Some(tx) {
            return Err(QueueError::Persistence(format!("Unknown transaction {}", tx)));
        }

        // The handle is released even if ROLLBACK fails; SQLite has then
        // already discarded the transaction.
        db.open = None;
        db.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| QueueError::Persistence(format!("Failed to roll back: {}", e)))?;

        debug!("Rolled back sink transaction {}", tx);

        Ok(())
    }
}

/// Row read back from `tracked_events`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub site_id: i64,
    pub url: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub tracked_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::Environment;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_commit_and_rollback() {
        let dir = tempdir().unwrap();
        let sink = SqliteSink::open(&dir.path().join("tracking.db")).await.unwrap();
        let env = Environment::new()
            .with_client_ip("10.1.1.1")
            .with_header("User-Agent", "curl/8");
        let context = EventContext {
            environment: &env,
            token_auth: None,
        };

        let tx = sink.begin_transaction().await.unwrap();
        sink.persist(tx, &Event::new([("idsite", "1"), ("url", "http://a")]), context)
            .await
            .unwrap();
        sink.commit(tx).await.unwrap();

        let tx = sink.begin_transaction().await.unwrap();
        sink.persist(tx, &Event::new([("idsite", "1"), ("url", "http://b")]), context)
            .await
            .unwrap();
        sink.rollback(tx).await.unwrap();

        assert_eq!(sink.count_events().await.unwrap(), 1);

        let stored = sink.events_for_site(1).await.unwrap();
        assert_eq!(stored[0].url.as_deref(), Some("http://a"));
        assert_eq!(stored[0].client_ip.as_deref(), Some("10.1.1.1"));
        assert_eq!(stored[0].user_agent.as_deref(), Some("curl/8"));
    }

    #[tokio::test]
    async fn test_invalid_event_is_recoverable() {
        let dir = tempdir().unwrap();
        let sink = SqliteSink::open(&dir.path().join("tracking.db")).await.unwrap();
        let env = Environment::new();
        let context = EventContext {
            environment: &env,
            token_auth: None,
        };

        let tx = sink.begin_transaction().await.unwrap();
        let err = sink
            .persist(tx, &Event::new([("url", "http://a")]), context)
            .await
            .unwrap_err();

        assert!(matches!(err, PersistError::Invalid(_)));
        sink.rollback(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_persist_outside_transaction_fails() {
        let dir = tempdir().unwrap();
        let sink = SqliteSink::open(&dir.path().join("tracking.db")).await.unwrap();
        let env = Environment::new();
        let context = EventContext {
            environment: &env,
            token_auth: None,
        };

        let err = sink
            .persist(TransactionId::new(), &Event::new([("idsite", "1")]), context)
            .await
            .unwrap_err();

        assert!(matches!(err, PersistError::Storage(_)));
    }
}

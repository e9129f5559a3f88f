// src/backend/sqlite.rs
//! SQLite-backed queue store
//!
//! Every process opening the same database file sees the same list and the
//! same lock. Each primitive is a single statement or a single `IMMEDIATE`
//! transaction, so SQLite's file locking makes it atomic across processes.
//!
//! ```text
//! queue_list(id AUTOINCREMENT, list_key, value)    -- ordered by id
//! queue_keys(key PRIMARY KEY, value, expires_at)   -- expires_at in ms
//! ```

use crate::backend::QueueBackend;
use crate::utils::config::BackendConfig;
use crate::utils::errors::{QueueError, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

fn db_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> QueueError {
    move |e| QueueError::Backend(format!("{}: {}", context, e))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// Queue store living in a SQLite file
pub struct SqliteBackend {
    path: PathBuf,
    db: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (and initialise) the database named in `config`
    pub async fn open(config: &BackendConfig) -> Result<Self> {
        Self::open_path(&config.path, config.busy_timeout()).await
    }

    /// Open (and initialise) the database at `path`
    pub async fn open_path(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                QueueError::Backend(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err("Failed to open queue database"))?;
        conn.busy_timeout(busy_timeout)
            .map_err(db_err("Failed to set busy timeout"))?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(db_err("Failed to enable WAL"))?;

        let backend = Self {
            path: path.to_path_buf(),
            db: Arc::new(Mutex::new(conn)),
        };

        backend.init_schema().await?;

        info!("Queue backend initialized at {:?}", backend.path);

        Ok(backend)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;

        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queue_list (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                list_key TEXT NOT NULL,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_list_key ON queue_list(list_key, id);
            CREATE TABLE IF NOT EXISTS queue_keys (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            );
            "#,
        )
        .map_err(db_err("Schema creation failed"))?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QueueBackend for SqliteBackend {
    async fn rpush(&self, key: &str, values: &[String]) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db
            .transaction()
            .map_err(db_err("Failed to start push transaction"))?;

        {
            let mut stmt = tx
                .prepare_cached("INSERT INTO queue_list (list_key, value) VALUES (?1, ?2)")
                .map_err(db_err("Query preparation failed"))?;
            for value in values {
                stmt.execute(params![key, value])
                    .map_err(db_err("Failed to append to list"))?;
            }
        }

        tx.commit().map_err(db_err("Failed to commit push"))?;

        debug!("Appended {} values to {}", values.len(), key);

        Ok(())
    }

    async fn lrange(&self, key: &str, count: usize) -> Result<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let db = self.db.lock().await;
        let mut stmt = db
            .prepare_cached(
                "SELECT value FROM queue_list WHERE list_key = ?1 ORDER BY id LIMIT ?2",
            )
            .map_err(db_err("Query preparation failed"))?;

        let values = stmt
            .query_map(params![key, count as i64], |row| row.get(0))
            .map_err(db_err("Query execution failed"))?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(db_err("Result collection failed"))?;

        Ok(values)
    }

    async fn ltrim_front(&self, key: &str, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        let db = self.db.lock().await;
        let removed = db
            .execute(
                r#"
                DELETE FROM queue_list WHERE id IN (
                    SELECT id FROM queue_list WHERE list_key = ?1 ORDER BY id LIMIT ?2
                )
                "#,
                params![key, count as i64],
            )
            .map_err(db_err("Failed to trim list"))?;

        debug!("Removed {} values from {}", removed, key);

        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let db = self.db.lock().await;
        let len: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM queue_list WHERE list_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map_err(db_err("Failed to count list"))?;

        Ok(len as usize)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Failed to start lock transaction"))?;

        let now = now_ms();
        tx.execute(
            "DELETE FROM queue_keys WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, now],
        )
        .map_err(db_err("Failed to purge expired key"))?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO queue_keys (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expiry_ms(ttl)],
            )
            .map_err(db_err("Failed to set key"))?;

        tx.commit().map_err(db_err("Failed to commit lock transaction"))?;

        Ok(inserted == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        db.query_row(
            "SELECT value FROM queue_keys WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![key, now_ms()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err("Failed to read key"))
    }

    async fn delete_if_equal(&self, key: &str, value: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let deleted = db
            .execute(
                r#"
                DELETE FROM queue_keys
                WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?3)
                "#,
                params![key, value, now_ms()],
            )
            .map_err(db_err("Failed to delete key"))?;

        Ok(deleted > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let db = self.db.lock().await;
        let updated = db
            .execute(
                r#"
                UPDATE queue_keys SET expires_at = ?2
                WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?3)
                "#,
                params![key, expiry_ms(ttl), now_ms()],
            )
            .map_err(db_err("Failed to expire key"))?;

        Ok(updated > 0)
    }

    async fn check_installed(&self) -> Result<()> {
        let db = self.db.lock().await;
        let tables: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('queue_list', 'queue_keys')",
                [],
                |row| row.get(0),
            )
            .map_err(db_err("Queue backend is not reachable"))?;

        if tables != 2 {
            return Err(QueueError::Backend(format!(
                "Queue tables missing in {:?}",
                self.path
            )));
        }

        Ok(())
    }
}

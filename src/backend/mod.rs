// src/backend/mod.rs
//! Backing stores for the queue list and the drain lock
//!
//! The queue and the lock only ever talk to the store through the atomic
//! primitives of [`QueueBackend`]. Nothing does read-modify-write on top of
//! them, so any store that implements each primitive atomically can be
//! shared by several processes.
//!
//! - **SqliteBackend**: shared SQLite file, the production store
//! - **MemoryBackend**: process-local store for tests and embedding
//!
//! # Architecture
//!
//! ```text
//! Queue ──── rpush / lrange / ltrim_front / llen ───┐
//!                                                    ├──► QueueBackend
//! DistributedLock ── set_if_absent / get / expire ───┘
//!                    delete_if_equal
//! ```

pub mod memory;
pub mod sqlite;

use crate::utils::config::{BackendConfig, BackendKind};
use crate::utils::errors::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

// Re-export commonly used types
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// List + key/value store contract
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append values to the tail of the list at `key`
    async fn rpush(&self, key: &str, values: &[String]) -> Result<()>;

    /// Return up to `count` values from the head of the list
    async fn lrange(&self, key: &str, count: usize) -> Result<Vec<String>>;

    /// Remove up to `count` values from the head of the list
    async fn ltrim_front(&self, key: &str, count: usize) -> Result<()>;

    /// Number of values in the list
    async fn llen(&self, key: &str) -> Result<usize>;

    /// Set `key` to `value` with a TTL unless an unexpired value exists.
    /// Returns whether the value was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Current unexpired value of `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key` only if it currently holds `value`.
    /// Returns whether a value was deleted.
    async fn delete_if_equal(&self, key: &str, value: &str) -> Result<bool>;

    /// Reset the TTL of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Verify the store is reachable and initialised
    async fn check_installed(&self) -> Result<()>;
}

/// Build the backend selected in the configuration
pub async fn build_backend(config: &BackendConfig) -> Result<Arc<dyn QueueBackend>> {
    match config.kind {
        BackendKind::Sqlite => Ok(Arc::new(SqliteBackend::open(config).await?)),
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}

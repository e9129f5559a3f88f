// src/utils/config.rs
//! Configuration loading
//!
//! Values are merged from three layers, later layers winning:
//!
//! 1. Built-in defaults
//! 2. `tracking-queue.toml` (or the file named by `TRACKING_QUEUE_CONFIG`)
//! 3. Environment variables, e.g. `TRACKING_QUEUE__QUEUE__BATCH_SIZE=100`

use crate::utils::errors::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "tracking-queue.toml";

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "TRACKING_QUEUE_CONFIG";

const ENV_PREFIX: &str = "TRACKING_QUEUE";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub queue: QueueConfig,
    pub lock: LockConfig,
    pub backend: BackendConfig,
    pub sink: SinkConfig,
    pub tracker: TrackerConfig,
    pub observability: ObservabilityConfig,
}

/// Queue behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Write tracking requests into the queue instead of persisting directly
    pub enabled: bool,

    /// Number of queued batches needed before draining starts, and the
    /// number of batches pulled per iteration
    pub batch_size: usize,

    /// Drain inline from the ingesting request once enough work is queued.
    /// When disabled, `tracking-queue process` must be scheduled externally.
    pub process_during_request: bool,

    /// Name of the list holding queued batches
    pub list_key: String,

    /// Name of the key holding the drain lock
    pub lock_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: 50,
            process_during_request: true,
            list_key: "trackingQueueV1".to_string(),
            lock_key: "trackingQueueLock".to_string(),
        }
    }
}

/// Drain lock TTL sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL used when first acquiring the lock
    pub acquire_ttl_secs: u64,

    /// Minimum TTL set when extending before each iteration
    pub ttl_floor_secs: u64,

    /// Extra TTL granted per event pulled in an iteration
    pub ttl_per_event_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_ttl_secs: 60,
            ttl_floor_secs: 30,
            ttl_per_event_ms: 250,
        }
    }
}

impl LockConfig {
    pub fn acquire_ttl(&self) -> Duration {
        Duration::from_secs(self.acquire_ttl_secs)
    }

    /// TTL to extend to before replaying `num_events` events
    pub fn ttl_for_events(&self, num_events: usize) -> Duration {
        let allowance = self.ttl_per_event_ms.saturating_mul(num_events as u64);
        Duration::from_secs(self.ttl_floor_secs) + Duration::from_millis(allowance)
    }
}

/// Backing store kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Shared SQLite file, usable by several processes
    Sqlite,

    /// Process-local store (tests, single-process embedding)
    Memory,
}

/// Backing store connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,

    /// Database file for the SQLite backend
    pub path: PathBuf,

    /// How long to wait on a locked database before failing
    pub busy_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Sqlite,
            path: PathBuf::from("data/queue.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl BackendConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Persistence engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Persist events into a SQLite database
    Sqlite,

    /// Only log events (dry runs)
    Log,
}

/// Persistence engine parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,

    /// Database file for the SQLite sink
    pub path: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Sqlite,
            path: PathBuf::from("data/tracking.db"),
        }
    }
}

/// Tracker-wide switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// When false, nothing is persisted and the queue is left untouched
    pub record_statistics: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            record_statistics: true,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub log_level: String,

    pub log_format: LogFormat,

    /// Address for the Prometheus scrape endpoint, disabled when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_addr: None,
        }
    }
}

impl TrackingConfig {
    /// Load configuration from the default file location and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

        // An explicitly named file must exist
        let required = std::env::var(CONFIG_PATH_ENV).is_ok();
        Self::load_from(&path, required)
    }

    /// Load configuration from `path` layered under the environment
    pub fn load_from(path: &Path, required: bool) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: TrackingConfig = settings.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        if self.queue.batch_size < 1 {
            return Err(QueueError::Config(
                "queue.batch_size should be 1 or higher".to_string(),
            ));
        }

        if self.queue.list_key.is_empty() || self.queue.lock_key.is_empty() {
            return Err(QueueError::Config(
                "queue.list_key and queue.lock_key must not be empty".to_string(),
            ));
        }

        if self.queue.list_key == self.queue.lock_key {
            return Err(QueueError::Config(
                "queue.list_key and queue.lock_key must differ".to_string(),
            ));
        }

        if self.lock.acquire_ttl_secs == 0 || self.lock.ttl_floor_secs == 0 {
            return Err(QueueError::Config(
                "lock TTLs must be at least one second".to_string(),
            ));
        }

        if self.backend.busy_timeout_ms > 600_000 {
            return Err(QueueError::Config(
                "backend.busy_timeout_ms cannot exceed 10 minutes".to_string(),
            ));
        }

        if self.backend.kind == BackendKind::Sqlite && self.backend.path.as_os_str().is_empty() {
            return Err(QueueError::Config(
                "backend.path is required for the sqlite backend".to_string(),
            ));
        }

        if self.sink.kind == SinkKind::Sqlite && self.sink.path.as_os_str().is_empty() {
            return Err(QueueError::Config(
                "sink.path is required for the sqlite sink".to_string(),
            ));
        }

        Ok(())
    }
}

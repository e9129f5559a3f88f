// src/observability/mod.rs
//! Logging and metrics setup
//!
//! - **Tracing**: `tracing-subscriber` registry with an `EnvFilter` and a
//!   pretty or JSON fmt layer
//! - **Metrics**: Prometheus scrape endpoint, only when an address is set
//!
//! # Metrics
//!
//! | name                                    | kind    |
//! |-----------------------------------------|---------|
//! | `tracking_queue_events_persisted_total` | counter |
//! | `tracking_queue_batches_retried_total`  | counter |
//! | `tracking_queue_events_dropped_total`   | counter |
//! | `tracking_queue_entries_discarded_total`| counter |
//! | `tracking_queue_drain_runs_total`       | counter |
//! | `tracking_queue_depth`                  | gauge   |

use crate::utils::config::{LogFormat, ObservabilityConfig};
use crate::utils::errors::{QueueError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const EVENTS_PERSISTED: &str = "tracking_queue_events_persisted_total";
pub const BATCHES_RETRIED: &str = "tracking_queue_batches_retried_total";
pub const EVENTS_DROPPED: &str = "tracking_queue_events_dropped_total";
pub const ENTRIES_DISCARDED: &str = "tracking_queue_entries_discarded_total";
pub const DRAIN_RUNS: &str = "tracking_queue_drain_runs_total";
pub const QUEUE_DEPTH: &str = "tracking_queue_depth";

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| QueueError::Config(format!("Invalid log level: {}", e)))?;

    let layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .json()
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| QueueError::Config(format!("Failed to install subscriber: {}", e)))?;

    Ok(())
}

/// Start the Prometheus exporter if `metrics_addr` is set
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(addr) = config.metrics_addr else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| QueueError::Config(format!("Failed to start metrics exporter: {}", e)))?;

    info!("Metrics exporter listening on {}", addr);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_address() {
        let config = ObservabilityConfig::default();
        assert!(init_metrics(&config).is_ok());
    }
}

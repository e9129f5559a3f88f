// src/sink/log.rs
//! Sink that only logs replayed events

use crate::sink::{validate_event, BatchSink, EventContext, TransactionId};
use crate::tracking::{Event, URL_PARAM};
use crate::utils::errors::{PersistError, Result};
use async_trait::async_trait;
use tracing::info;

/// Logs every event at `info` instead of storing it
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BatchSink for LogSink {
    async fn begin_transaction(&self) -> Result<TransactionId> {
        Ok(TransactionId::new())
    }

    async fn persist(
        &self,
        tx: TransactionId,
        event: &Event,
        context: EventContext<'_>,
    ) -> std::result::Result<(), PersistError> {
        let site_id = validate_event(event)?;
        let url = event.param(URL_PARAM).map(ToString::to_string);

        info!(
            %tx,
            site_id,
            url = url.as_deref().unwrap_or("-"),
            client_ip = context.environment.client_ip().unwrap_or("-"),
            params = event.params().len(),
            "tracked event"
        );

        Ok(())
    }

    async fn commit(&self, _tx: TransactionId) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, _tx: TransactionId) -> Result<()> {
        Ok(())
    }
}

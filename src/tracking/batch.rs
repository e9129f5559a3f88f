// src/tracking/batch.rs
//! Event batches: one client submission plus its replay context
//!
//! A batch is what travels through the queue. It is serialized to a JSON
//! string when enqueued and restored by the processor:
//!
//! ```text
//! {"events":[{"params":{"idsite":"1",...},"captured_at":1700000000000}],
//!  "env":{"client_ip":"10.0.0.1","headers":{"user-agent":"..."}},
//!  "token_auth":"...","time":1700000000000}
//! ```

use crate::tracking::event::{Environment, Event};
use crate::utils::errors::{QueueError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered events submitted together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Events in submission order
    events: Vec<Event>,

    /// Request context captured at ingestion
    #[serde(rename = "env", default)]
    environment: Environment,

    /// Token supplied with the whole submission (bulk requests)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_auth: Option<String>,

    /// Time the batch was received
    #[serde(rename = "time", with = "chrono::serde::ts_milliseconds")]
    captured_at: DateTime<Utc>,
}

impl EventBatch {
    /// Create a batch captured now
    pub fn new(events: Vec<Event>, environment: Environment) -> Self {
        Self {
            events,
            environment,
            token_auth: None,
            captured_at: Utc::now(),
        }
    }

    /// Batch holding a single event
    pub fn single(event: Event, environment: Environment) -> Self {
        Self::new(vec![event], environment)
    }

    pub fn with_token_auth(mut self, token: impl Into<String>) -> Self {
        self.token_auth = Some(token.into());
        self
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn token_auth(&self) -> Option<&str> {
        self.token_auth.as_deref()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Token to authenticate `event` with: its own, else the batch token
    pub fn token_for<'a>(&'a self, event: &'a Event) -> Option<&'a str> {
        event.token_auth().or(self.token_auth())
    }

    /// Keep only the first `len` events
    ///
    /// This is the only mutation a batch goes through: after a failure the
    /// events from the failing one onwards are dropped.
    pub fn truncate(&mut self, len: usize) {
        self.events.truncate(len);
    }

    /// Encode as a queue entry
    ///
    /// Fails on parameters that would not decode again (non-finite floats),
    /// so such a batch is refused at enqueue time instead of being lost.
    pub fn to_entry(&self) -> Result<String> {
        for event in &self.events {
            let unencodable = event.params().iter().find(|(_, v)| !v.is_encodable());
            if let Some((name, value)) = unencodable {
                return Err(QueueError::Serialization(format!(
                    "Parameter '{}' has unencodable value {}",
                    name, value
                )));
            }
        }

        serde_json::to_string(self).map_err(|e| {
            QueueError::Serialization(format!("Failed to encode event batch: {}", e))
        })
    }

    /// Decode a queue entry
    pub fn from_entry(entry: &str) -> Result<Self> {
        serde_json::from_str(entry).map_err(|e| {
            QueueError::Serialization(format!("Failed to decode event batch: {}", e))
        })
    }
}

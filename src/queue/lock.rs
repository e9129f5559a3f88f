// src/queue/lock.rs
//! Time-bounded drain lock
//!
//! A single key in the backend holds the owner token of whoever is draining.
//! Acquiring is an atomic set-if-absent with a TTL; releasing is an atomic
//! compare-and-delete. A crashed holder therefore blocks draining for at
//! most one TTL.

use crate::backend::QueueBackend;
use crate::utils::errors::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One contender for the drain lock
///
/// Each instance keeps the token of its last acquire attempt. Two instances
/// never share a token, even within the same process.
pub struct DistributedLock {
    backend: Arc<dyn QueueBackend>,
    key: String,
    token: Option<String>,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn QueueBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            token: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Try to take the lock for `ttl`; never overwrites a live lock
    pub async fn acquire(&mut self, ttl: Duration) -> Result<bool> {
        let token = format!("{:032x}", rand::random::<u128>());
        let acquired = self.backend.set_if_absent(&self.key, &token, ttl).await?;

        if acquired {
            debug!("Acquired lock {} for {:?}", self.key, ttl);
        }
        self.token = Some(token);

        Ok(acquired)
    }

    /// Whether the stored token is still ours
    pub async fn is_held_by_me(&self) -> Result<bool> {
        let Some(token) = &self.token else {
            return Ok(false);
        };

        Ok(self.backend.get(&self.key).await?.as_deref() == Some(token.as_str()))
    }

    /// Refresh the TTL of a lock we hold
    ///
    /// Returns false if the lock is no longer ours. Between the ownership
    /// check and the refresh another owner may take over an expired lock;
    /// the caller re-checks ownership before committing anything.
    pub async fn extend(&self, ttl: Duration) -> Result<bool> {
        if !self.is_held_by_me().await? {
            return Ok(false);
        }

        self.backend.expire(&self.key, ttl).await
    }

    /// Release the lock if it is still ours
    pub async fn release(&mut self) -> Result<bool> {
        let Some(token) = self.token.take() else {
            return Ok(false);
        };

        let released = self.backend.delete_if_equal(&self.key, &token).await?;
        if !released {
            warn!("Lock {} was no longer held at release", self.key);
        }

        Ok(released)
    }
}

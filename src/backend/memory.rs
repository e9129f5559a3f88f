// src/backend/memory.rs
//! Process-local backend
//!
//! Expiry uses `tokio::time::Instant`, so tests can move the clock with
//! `tokio::time::pause()` / `advance()`.

use crate::backend::QueueBackend;
use crate::utils::errors::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    keys: HashMap<String, Entry>,
}

impl State {
    fn live_key(&mut self, key: &str) -> Option<&Entry> {
        let now = Instant::now();
        if self.keys.get(key).is_some_and(|e| !e.is_live(now)) {
            self.keys.remove(key);
        }
        self.keys.get(key)
    }
}

/// In-memory list + key/value store
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop `key` as if its TTL had run out
    pub fn force_expire(&self, key: &str) {
        self.state.lock().keys.remove(key);
    }

    /// Remaining TTL of `key`, if it exists and has one
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        state
            .live_key(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn rpush(&self, key: &str, values: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .extend(values.iter().cloned());
        Ok(())
    }

    async fn lrange(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn ltrim_front(&self, key: &str, count: usize) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(list) = state.lists.get_mut(key) {
            let n = count.min(list.len());
            list.drain(..n);
        }
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let state = self.state.lock();
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if state.live_key(key).is_some() {
            return Ok(false);
        }

        state.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        Ok(state.live_key(key).map(|e| e.value.clone()))
    }

    async fn delete_if_equal(&self, key: &str, value: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if state.live_key(key).is_some_and(|e| e.value == value) {
            state.keys.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if state.live_key(key).is_none() {
            return Ok(false);
        }

        if let Some(entry) = state.keys.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn check_installed(&self) -> Result<()> {
        Ok(())
    }
}

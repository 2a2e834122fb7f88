//! Counter store seam used by rate limiting and send throttling.
//!
//! The values are plain `i64`s: attempt counts and absolute unix-second
//! expiries. Increments must be atomic: two concurrent failed attempts must
//! never produce a lost update. Back this with Redis (`INCR` + `EXPIRE`) or
//! any store with equivalent semantics in multi-process deployments.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Ephemeral key-value counters with TTL.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read a value. `Ok(None)` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Write a value, replacing any previous one and resetting the TTL.
    async fn put(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<()>;

    /// Atomically increment by one, returning the new value.
    ///
    /// A missing or expired key counts from zero. When `ttl` is given, the
    /// expiry is refreshed on every increment.
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

struct Entry {
    value: i64,
    expires_at: Option<SystemTime>,
}

impl Entry {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory counter store.
///
/// A single mutex serializes read-modify-write cycles, which is what makes
/// `increment` atomic. Suitable for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCounterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let now = SystemTime::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|t| SystemTime::now() + t);
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let now = SystemTime::now();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if e.is_expired(now) {
                    e.value = 0;
                    e.expires_at = None;
                }
            })
            .or_insert(Entry {
                value: 0,
                expires_at: None,
            });
        entry.value += 1;
        if let Some(t) = ttl {
            entry.expires_at = Some(now + t);
        }
        Ok(entry.value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

//! In-Memory Cache Store
//!
//! `CacheStore` implementation backed by a `DashMap`, with per-key TTL.
//! Used by the demo binary and by tests; semantics mirror the Redis
//! commands the production store uses (GET, SET EX, SET NX PX, DEL, INCR).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::domain::ports::CacheStore;
use crate::error::{Error, Result};

/// A stored value and its expiry deadline
#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// Cache store statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStoreStats {
    /// Live and not-yet-purged keys
    pub key_count: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// In-memory cache store.
///
/// Expired keys are purged lazily on access.
pub struct InMemoryCacheStore {
    entries: DashMap<String, StoredValue>,
    available: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with [`Error::Cache`]
    /// while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remaining time-to-live of a live key (`None` for absent or persistent keys).
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            return None;
        }
        entry
            .expires_at
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn stats(&self) -> CacheStoreStats {
        CacheStoreStats {
            key_count: self.entries.len() as u64,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Cache("cache store unavailable".to_string()))
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }

        // Purge outside the read guard
        self.entries.remove_if(key, |_, v| v.is_expired());
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        // The entry guard holds the shard lock, so check-and-set is atomic
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredValue::new(value, Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .entries
            .remove(key)
            .map(|(_, v)| !v.is_expired())
            .unwrap_or(false))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        self.check_available()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .entries
            .remove_if(key, |_, v| !v.is_expired() && v.value == expected)
            .is_some())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new("0", None));
        if entry.is_expired() {
            *entry = StoredValue::new("0", None);
        }

        let current: i64 = entry.value.parse().map_err(|_| {
            Error::Cache(format!("value at '{}' is not an integer", key))
        })?;
        let next = current
            .checked_add(1)
            .ok_or_else(|| Error::Cache(format!("increment of '{}' would overflow", key)))?;
        entry.value = next.to_string();
        Ok(next)
    }
}

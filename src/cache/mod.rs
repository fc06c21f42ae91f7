//! Cache Guard
//!
//! Protects the relational store from query storms.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         CacheAside::get(id)                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ExistenceFilter ──absent──▶ NotFound         (cache penetration)         │
//! │        │                                                                  │
//! │     possibly                                                              │
//! │        ▼                                                                  │
//! │  CacheStore::get ──hit──▶ entity                                          │
//! │        │                                                                  │
//! │      miss                                                                 │
//! │        ▼                                                                  │
//! │  RebuildMutex ──busy──▶ jittered sleep, retry  (cache breakdown)          │
//! │        │                                                                  │
//! │     acquired                                                              │
//! │        ▼                                                                  │
//! │  Repository::get_by_id ──▶ filter.add + cache set ──▶ release             │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes go to the store first and then delete the cache key; the next read
//! rebuilds it.

mod filter;
mod mutex;
mod reader;
mod type_list;
mod warmup;

pub use filter::{ExistenceFilter, FilterConfig};
pub use mutex::{LockToken, RebuildMutex, RetryPolicy};
pub use reader::{CacheAside, LogicalEntry, ReaderConfig};
pub use type_list::TypeListCache;
pub use warmup::warm_up_filter;

use std::time::Duration;

/// Prefix of shop cache keys
pub const CACHE_SHOP_KEY: &str = "cache:shop:";

/// Prefix of shop rebuild-lock keys
pub const LOCK_SHOP_KEY: &str = "lock:shop:";

/// Key of the cached shop-type list
pub const CACHE_SHOP_TYPE_KEY: &str = "cache:shop-type";

/// Shop cache TTL (30 minutes)
pub const CACHE_SHOP_TTL: Duration = Duration::from_secs(30 * 60);

/// Rebuild lock TTL (10 seconds)
pub const LOCK_SHOP_TTL: Duration = Duration::from_secs(10);

/// TTL of "does not exist" markers when negative caching is on (2 minutes)
pub const CACHE_NULL_TTL: Duration = Duration::from_secs(2 * 60);

/// Shop-type list TTL (10 minutes)
pub const CACHE_SHOP_TYPE_TTL: Duration = Duration::from_secs(10 * 60);

/// Cache and lock key naming for one entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    cache_prefix: String,
    lock_prefix: String,
}

impl KeySpace {
    pub fn new(cache_prefix: impl Into<String>, lock_prefix: impl Into<String>) -> Self {
        Self {
            cache_prefix: cache_prefix.into(),
            lock_prefix: lock_prefix.into(),
        }
    }

    /// `cache:shop:{id}` / `lock:shop:{id}`
    pub fn shop() -> Self {
        Self::new(CACHE_SHOP_KEY, LOCK_SHOP_KEY)
    }

    pub fn cache_key(&self, id: i64) -> String {
        format!("{}{}", self.cache_prefix, id)
    }

    pub fn lock_key(&self, id: i64) -> String {
        format!("{}{}", self.lock_prefix, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shop_key_names() {
        let keys = KeySpace::shop();
        assert_eq!(keys.cache_key(1), "cache:shop:1");
        assert_eq!(keys.lock_key(1), "lock:shop:1");
    }

    #[test]
    fn test_default_ttls() {
        assert_eq!(CACHE_SHOP_TTL, Duration::from_secs(1800));
        assert_eq!(LOCK_SHOP_TTL, Duration::from_secs(10));
        assert!(CACHE_NULL_TTL < CACHE_SHOP_TTL);
    }
}

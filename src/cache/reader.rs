//! Cache-Aside Reader
//!
//! Read path: existence filter, then cache, then a single-flight rebuild
//! from the store under the rebuild mutex. Write path: store first, then
//! delete the cache key.
//!
//! Two supplementary read strategies share the same keys:
//! - [`CacheAside::get_pass_through`] - filter and cache only, no mutex
//! - [`CacheAside::get_with_logical_expire`] - values carry their own expiry
//!   and are served stale while one background task refreshes them

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::filter::ExistenceFilter;
use super::mutex::{LockToken, RebuildMutex, RetryPolicy};
use super::{KeySpace, CACHE_SHOP_TTL, LOCK_SHOP_TTL};
use crate::domain::events::DomainEvent;
use crate::domain::model::Entity;
use crate::domain::ports::{CacheStore, EventPublisher, Repository};
use crate::error::{Error, Result};
use crate::metrics::{GuardMetrics, LookupOutcome};

/// Marker cached for ids the store does not know (negative caching only)
const NEGATIVE_MARKER: &str = "";

// =============================================================================
// Configuration
// =============================================================================

/// Reader configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderConfig {
    /// TTL of rebuilt entries (and logical TTL of logical-expiry entries)
    pub cache_ttl: Duration,
    /// TTL of the rebuild lock
    pub lock_ttl: Duration,
    /// Retry budget while another task holds the rebuild lock
    pub retry: RetryPolicy,
    /// Cache store misses for this long. `None` disables negative caching.
    pub negative_ttl: Option<Duration>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            cache_ttl: CACHE_SHOP_TTL,
            lock_ttl: LOCK_SHOP_TTL,
            retry: RetryPolicy::default(),
            negative_ttl: None,
        }
    }
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if self.cache_ttl.is_zero() || self.lock_ttl.is_zero() {
            return Err(Error::Config(
                "reader cache_ttl and lock_ttl must be non-zero".to_string(),
            ));
        }
        if matches!(self.negative_ttl, Some(ttl) if ttl.is_zero()) {
            return Err(Error::Config(
                "reader negative_ttl must be non-zero when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Envelope for logical-expiration entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalEntry<T> {
    pub expire_time: DateTime<Utc>,
    pub data: T,
}

enum Lookup<T> {
    /// Definitely absent (filter reject or negative marker)
    Absent,
    Found(T),
    Miss,
}

// =============================================================================
// Reader
// =============================================================================

/// Cache-aside reader for one entity kind.
#[derive(Clone)]
pub struct CacheAside<T: Entity> {
    cache: Arc<dyn CacheStore>,
    repository: Arc<dyn Repository<T>>,
    filter: Arc<ExistenceFilter>,
    mutex: RebuildMutex,
    keys: KeySpace,
    config: ReaderConfig,
    metrics: Arc<GuardMetrics>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl<T: Entity> CacheAside<T> {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        repository: Arc<dyn Repository<T>>,
        filter: Arc<ExistenceFilter>,
        keys: KeySpace,
        config: ReaderConfig,
        metrics: Arc<GuardMetrics>,
    ) -> Self {
        Self {
            mutex: RebuildMutex::new(Arc::clone(&cache)),
            cache,
            repository,
            filter,
            keys,
            config,
            metrics,
            events: None,
        }
    }

    /// Publish a `CacheInvalidated` event on every update.
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn filter(&self) -> &ExistenceFilter {
        &self.filter
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Read through the cache with a single-flight rebuild.
    ///
    /// `Ok(None)` means the entity does not exist. Fails with
    /// [`Error::LockTimeout`] if the rebuild lock stays busy for the whole
    /// retry budget.
    #[instrument(skip(self), fields(key = %self.keys.cache_key(id)))]
    pub async fn get(&self, id: i64) -> Result<Option<T>> {
        let key = self.keys.cache_key(id);
        let lock_key = self.keys.lock_key(id);
        let policy = &self.config.retry;

        for attempt in 1..=policy.max_attempts {
            match self.lookup(&key).await? {
                Lookup::Absent => return Ok(None),
                Lookup::Found(entity) => return Ok(Some(entity)),
                Lookup::Miss => {}
            }

            if let Some(token) = self.mutex.try_acquire(&lock_key, self.config.lock_ttl).await? {
                let result = self.rebuild_locked(id, &key).await;
                self.release(token).await;
                return result;
            }

            self.metrics.record_lock_contention("rebuild");
            debug!(attempt, "Rebuild lock busy, retrying");
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.backoff()).await;
            }
        }

        self.metrics.record_lock_timeout("rebuild");
        warn!(attempts = policy.max_attempts, "Gave up waiting for rebuild lock");
        Err(Error::LockTimeout {
            key: lock_key,
            attempts: policy.max_attempts,
        })
    }

    /// Read through the cache without the rebuild mutex.
    ///
    /// Still filters out unknown ids, but concurrent misses all hit the store.
    pub async fn get_pass_through(&self, id: i64) -> Result<Option<T>> {
        let key = self.keys.cache_key(id);
        match self.lookup(&key).await? {
            Lookup::Absent => Ok(None),
            Lookup::Found(entity) => Ok(Some(entity)),
            Lookup::Miss => self.load_and_fill(id, &key).await,
        }
    }

    /// Persist the entity, then drop its cache entry.
    ///
    /// Returns `false` if the store has no row for the entity.
    #[instrument(skip(self, entity), fields(id = entity.entity_id()))]
    pub async fn update(&self, entity: &T) -> Result<bool> {
        let id = entity.entity_id();
        let updated = self.repository.update_by_id(entity).await?;

        let key = self.keys.cache_key(id);
        self.cache.delete(&key).await?;
        debug!(key = %key, updated, "Cache entry invalidated");

        if let Some(events) = &self.events {
            if let Err(e) = events.publish(DomainEvent::cache_invalidated(key)).await {
                warn!(error = %e, "Failed to publish invalidation event");
            }
        }
        Ok(updated)
    }

    // =========================================================================
    // Logical expiration
    // =========================================================================

    /// Preload an entity wrapped in a [`LogicalEntry`] that expires after
    /// `ttl`. The cache key itself never expires.
    ///
    /// Returns `false` if the store has no such entity.
    pub async fn save_with_logical_expire(&self, id: i64, ttl: Duration) -> Result<bool> {
        let Some(entity) = self.repository.get_by_id(id).await? else {
            return Ok(false);
        };
        let key = self.keys.cache_key(id);
        self.write_logical(&key, entity, ttl).await?;
        Ok(true)
    }

    /// Read a logical-expiration entry.
    ///
    /// Entries must be preloaded; a miss means the id is not served by this
    /// strategy. An expired entry is returned as-is while the winner of the
    /// rebuild lock refreshes it in the background.
    pub async fn get_with_logical_expire(&self, id: i64) -> Result<Option<T>> {
        let key = self.keys.cache_key(id);
        if !self.filter.might_contain(&key) {
            self.metrics.record_lookup(LookupOutcome::FilterReject);
            return Ok(None);
        }

        let Some(entry) = self.read_logical(&key).await? else {
            self.metrics.record_lookup(LookupOutcome::Miss);
            return Ok(None);
        };
        if entry.expire_time > Utc::now() {
            self.metrics.record_lookup(LookupOutcome::Hit);
            return Ok(Some(entry.data));
        }

        let lock_key = self.keys.lock_key(id);
        if let Some(token) = self.mutex.try_acquire(&lock_key, self.config.lock_ttl).await? {
            // Another task may have refreshed between our read and the lock
            if let Some(fresh) = self.read_logical(&key).await? {
                if fresh.expire_time > Utc::now() {
                    self.release(token).await;
                    self.metrics.record_lookup(LookupOutcome::Hit);
                    return Ok(Some(fresh.data));
                }
            }

            let reader = self.clone();
            let ttl = self.config.cache_ttl;
            tokio::spawn(async move {
                match reader.save_with_logical_expire(id, ttl).await {
                    Ok(true) => info!(id, "Logical entry refreshed"),
                    Ok(false) => warn!(id, "Entity vanished during logical refresh"),
                    Err(e) => warn!(id, error = %e, "Logical refresh failed"),
                }
                reader.release(token).await;
            });
        }

        self.metrics.record_lookup(LookupOutcome::Stale);
        Ok(Some(entry.data))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn lookup(&self, key: &str) -> Result<Lookup<T>> {
        if !self.filter.might_contain(key) {
            self.metrics.record_lookup(LookupOutcome::FilterReject);
            return Ok(Lookup::Absent);
        }

        match self.cache.get(key).await? {
            Some(json) if json == NEGATIVE_MARKER => {
                self.metrics.record_lookup(LookupOutcome::NegativeHit);
                Ok(Lookup::Absent)
            }
            Some(json) => {
                self.metrics.record_lookup(LookupOutcome::Hit);
                Ok(Lookup::Found(serde_json::from_str(&json)?))
            }
            None => {
                self.metrics.record_lookup(LookupOutcome::Miss);
                Ok(Lookup::Miss)
            }
        }
    }

    /// Rebuild while holding the lock. Re-checks the cache first so a task
    /// that lost the race to a finished rebuild does not read the store.
    async fn rebuild_locked(&self, id: i64, key: &str) -> Result<Option<T>> {
        match self.lookup(key).await? {
            Lookup::Absent => Ok(None),
            Lookup::Found(entity) => Ok(Some(entity)),
            Lookup::Miss => self.load_and_fill(id, key).await,
        }
    }

    async fn load_and_fill(&self, id: i64, key: &str) -> Result<Option<T>> {
        match self.repository.get_by_id(id).await? {
            Some(entity) => {
                let json = serde_json::to_string(&entity)?;
                // Register before the write so a cached key is always in the filter
                self.filter.add(key);
                self.cache
                    .set(key, &json, Some(self.config.cache_ttl))
                    .await?;
                self.metrics.record_rebuild();
                debug!(key = %key, "Cache entry rebuilt");
                Ok(Some(entity))
            }
            None => {
                if let Some(ttl) = self.config.negative_ttl {
                    self.cache.set(key, NEGATIVE_MARKER, Some(ttl)).await?;
                }
                debug!(key = %key, "Store miss");
                Ok(None)
            }
        }
    }

    async fn write_logical(&self, key: &str, entity: T, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Config(format!("logical ttl out of range: {}", e)))?;
        let entry = LogicalEntry {
            expire_time: Utc::now() + ttl,
            data: entity,
        };
        let json = serde_json::to_string(&entry)?;
        self.filter.add(key);
        self.cache.set(key, &json, None).await
    }

    async fn read_logical(&self, key: &str) -> Result<Option<LogicalEntry<T>>> {
        match self.cache.get(key).await? {
            Some(json) if json != NEGATIVE_MARKER => Ok(Some(serde_json::from_str(&json)?)),
            _ => Ok(None),
        }
    }

    /// Release failures only delay the next rebuild until the lock TTL runs
    /// out, so they are logged rather than returned.
    async fn release(&self, token: LockToken) {
        if let Err(e) = self.mutex.release(token).await {
            warn!(error = %e, "Failed to release rebuild lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCacheStore, InMemoryDatabase};
    use crate::domain::model::Shop;
    use assert_matches::assert_matches;

    struct Fixture {
        cache: Arc<InMemoryCacheStore>,
        db: InMemoryDatabase,
        reader: CacheAside<Shop>,
        metrics: Arc<GuardMetrics>,
    }

    fn fixture(config: ReaderConfig) -> Fixture {
        let cache = Arc::new(InMemoryCacheStore::new());
        let db = InMemoryDatabase::new();
        db.insert_shop(Shop::new(1, "Noodle Bar", 1));
        let filter = Arc::new(
            ExistenceFilter::with_config(crate::cache::FilterConfig {
                expected_insertions: 1_000,
                false_positive_rate: 0.01,
            })
            .unwrap(),
        );
        filter.add("cache:shop:1");
        let metrics = Arc::new(GuardMetrics::new().unwrap());
        let reader = CacheAside::new(
            cache.clone(),
            Arc::new(db.clone()),
            filter,
            KeySpace::shop(),
            config,
            metrics.clone(),
        );
        Fixture {
            cache,
            db,
            reader,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_filter_rejects_unknown_ids_without_io() {
        let f = fixture(ReaderConfig::default());

        assert!(f.reader.get(404).await.unwrap().is_none());
        assert_eq!(f.db.shop_reads(), 0);
        assert_eq!(f.cache.stats().reads, 0);
        assert_eq!(f.metrics.lookups(LookupOutcome::FilterReject), 1);
    }

    #[tokio::test]
    async fn test_rebuild_then_hit() {
        let f = fixture(ReaderConfig::default());

        let shop = f.reader.get(1).await.unwrap().unwrap();
        assert_eq!(shop.name, "Noodle Bar");
        assert_eq!(f.db.shop_reads(), 1);
        assert!(f.cache.ttl("cache:shop:1").unwrap() <= CACHE_SHOP_TTL);
        // Lock released
        assert!(f.cache.get("lock:shop:1").await.unwrap().is_none());

        let again = f.reader.get(1).await.unwrap().unwrap();
        assert_eq!(again, shop);
        assert_eq!(f.db.shop_reads(), 1);
        assert_eq!(f.metrics.rebuilds(), 1);
    }

    #[tokio::test]
    async fn test_store_miss_is_not_cached_by_default() {
        let f = fixture(ReaderConfig::default());
        f.reader.filter().add("cache:shop:2");

        assert!(f.reader.get(2).await.unwrap().is_none());
        assert!(f.reader.get(2).await.unwrap().is_none());
        assert_eq!(f.db.shop_reads(), 2);
        assert!(f.cache.get("lock:shop:2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_negative_caching_when_enabled() {
        let f = fixture(ReaderConfig {
            negative_ttl: Some(Duration::from_secs(120)),
            ..ReaderConfig::default()
        });
        f.reader.filter().add("cache:shop:2");

        assert!(f.reader.get(2).await.unwrap().is_none());
        assert!(f.reader.get(2).await.unwrap().is_none());
        assert_eq!(f.db.shop_reads(), 1);
        assert_eq!(f.metrics.lookups(LookupOutcome::NegativeHit), 1);
    }

    #[tokio::test]
    async fn test_update_deletes_cache_entry() {
        let f = fixture(ReaderConfig::default());
        f.reader.get(1).await.unwrap();
        assert!(f.cache.get("cache:shop:1").await.unwrap().is_some());

        let mut shop = Shop::new(1, "Noodle Bar Deluxe", 1);
        shop.avg_price = 120;
        assert!(f.reader.update(&shop).await.unwrap());
        assert!(f.cache.get("cache:shop:1").await.unwrap().is_none());

        let reread = f.reader.get(1).await.unwrap().unwrap();
        assert_eq!(reread.name, "Noodle Bar Deluxe");
        assert_eq!(f.db.shop_reads(), 2);
    }

    #[tokio::test]
    async fn test_update_of_unknown_entity() {
        let f = fixture(ReaderConfig::default());
        f.cache.set("cache:shop:9", "{}", None).await.unwrap();

        assert!(!f.reader.update(&Shop::new(9, "Ghost", 1)).await.unwrap());
        assert!(f.cache.get("cache:shop:9").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_lock_times_out() {
        let f = fixture(ReaderConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(50),
                jitter: Duration::ZERO,
            },
            ..ReaderConfig::default()
        });
        f.cache
            .set("lock:shop:1", "someone-else", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        let result = f.reader.get(1).await;
        assert_matches!(result, Err(Error::LockTimeout { attempts: 3, .. }));
        assert_eq!(f.db.shop_reads(), 0);
    }

    #[tokio::test]
    async fn test_storage_fault_is_not_not_found() {
        let f = fixture(ReaderConfig::default());
        f.db.set_available(false);

        let err = f.reader.get(1).await.unwrap_err();
        assert!(err.is_storage_fault());
        // Lock released even though the rebuild failed
        assert!(f.cache.get("lock:shop:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_cache_entry_is_an_error() {
        let f = fixture(ReaderConfig::default());
        f.cache.set("cache:shop:1", "{not json", None).await.unwrap();
        assert_matches!(f.reader.get(1).await, Err(Error::Serialization(_)));
    }

    #[tokio::test]
    async fn test_pass_through_fills_cache() {
        let f = fixture(ReaderConfig::default());
        assert!(f.reader.get_pass_through(1).await.unwrap().is_some());
        assert!(f.reader.get_pass_through(1).await.unwrap().is_some());
        assert_eq!(f.db.shop_reads(), 1);
        assert!(f.reader.get_pass_through(404).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logical_expire_fresh_entry() {
        let f = fixture(ReaderConfig::default());
        assert!(f
            .reader
            .save_with_logical_expire(1, Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!f
            .reader
            .save_with_logical_expire(404, Duration::from_secs(60))
            .await
            .unwrap());
        // Stored without a physical TTL
        assert!(f.cache.ttl("cache:shop:1").is_none());

        let shop = f.reader.get_with_logical_expire(1).await.unwrap().unwrap();
        assert_eq!(shop.name, "Noodle Bar");
        assert_eq!(f.metrics.lookups(LookupOutcome::Hit), 1);
    }

    #[tokio::test]
    async fn test_logical_expire_serves_stale_and_refreshes() {
        let f = fixture(ReaderConfig::default());
        let stale = LogicalEntry {
            expire_time: Utc::now() - chrono::Duration::seconds(5),
            data: Shop::new(1, "Old Name", 1),
        };
        f.cache
            .set("cache:shop:1", &serde_json::to_string(&stale).unwrap(), None)
            .await
            .unwrap();

        let served = f.reader.get_with_logical_expire(1).await.unwrap().unwrap();
        assert_eq!(served.name, "Old Name");

        // Wait for the background refresh to land
        let mut refreshed = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let shop = f.reader.get_with_logical_expire(1).await.unwrap().unwrap();
            if shop.name == "Noodle Bar" {
                refreshed = Some(shop);
                break;
            }
        }
        assert!(refreshed.is_some());
        assert!(f.cache.get("lock:shop:1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_stale_reads_refresh_once() {
        let f = fixture(ReaderConfig::default());
        let stale = LogicalEntry {
            expire_time: Utc::now() - chrono::Duration::seconds(5),
            data: Shop::new(1, "Old Name", 1),
        };
        f.cache
            .set("cache:shop:1", &serde_json::to_string(&stale).unwrap(), None)
            .await
            .unwrap();
        f.db.set_read_delay(Duration::from_millis(100));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let reader = f.reader.clone();
                tokio::spawn(async move { reader.get_with_logical_expire(1).await })
            })
            .collect();
        for handle in handles {
            let shop = handle.await.unwrap().unwrap().unwrap();
            assert_eq!(shop.name, "Old Name");
        }

        // Let the single refresh finish and release the lock
        for _ in 0..100 {
            if f.cache.get("lock:shop:1").await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.cache.get("lock:shop:1").await.unwrap().is_none());
        assert_eq!(f.db.shop_reads(), 1);
        assert_eq!(f.metrics.lookups(LookupOutcome::Stale), 50);
    }

    #[tokio::test]
    async fn test_logical_expire_miss_without_preload() {
        let f = fixture(ReaderConfig::default());
        assert!(f.reader.get_with_logical_expire(1).await.unwrap().is_none());
        assert_eq!(f.db.shop_reads(), 0);
    }
}

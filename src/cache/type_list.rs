//! Cached shop-type list
//!
//! The whole list lives under one key as a JSON array. A miss (or an empty
//! cached list) re-queries the store; an empty store result is not cached.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{CACHE_SHOP_TYPE_KEY, CACHE_SHOP_TYPE_TTL};
use crate::domain::model::ShopType;
use crate::domain::ports::{CacheStore, ShopTypeRepository};
use crate::error::Result;
use crate::metrics::{GuardMetrics, LookupOutcome};

pub struct TypeListCache {
    cache: Arc<dyn CacheStore>,
    repository: Arc<dyn ShopTypeRepository>,
    metrics: Arc<GuardMetrics>,
    ttl: Duration,
}

impl TypeListCache {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        repository: Arc<dyn ShopTypeRepository>,
        metrics: Arc<GuardMetrics>,
    ) -> Self {
        Self {
            cache,
            repository,
            metrics,
            ttl: CACHE_SHOP_TYPE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Shop types ordered by `sort`.
    pub async fn list(&self) -> Result<Vec<ShopType>> {
        if let Some(json) = self.cache.get(CACHE_SHOP_TYPE_KEY).await? {
            let cached: Vec<ShopType> = serde_json::from_str(&json)?;
            if !cached.is_empty() {
                self.metrics.record_lookup(LookupOutcome::Hit);
                return Ok(cached);
            }
        }
        self.metrics.record_lookup(LookupOutcome::Miss);

        let types = self.repository.list_ordered().await?;
        if types.is_empty() {
            debug!("No shop types in store");
            return Ok(types);
        }

        let json = serde_json::to_string(&types)?;
        self.cache
            .set(CACHE_SHOP_TYPE_KEY, &json, Some(self.ttl))
            .await?;
        self.metrics.record_rebuild();
        Ok(types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCacheStore, InMemoryDatabase};

    fn shop_type(id: i64, name: &str, sort: i32) -> ShopType {
        ShopType {
            id,
            name: name.to_string(),
            icon: format!("/types/{}.png", id),
            sort,
        }
    }

    fn list_cache(db: &InMemoryDatabase) -> (Arc<InMemoryCacheStore>, TypeListCache) {
        let cache = Arc::new(InMemoryCacheStore::new());
        let metrics = Arc::new(GuardMetrics::new().unwrap());
        let types = TypeListCache::new(cache.clone(), Arc::new(db.clone()), metrics);
        (cache, types)
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_cached() {
        let db = InMemoryDatabase::new();
        db.insert_shop_type(shop_type(2, "KTV", 3));
        db.insert_shop_type(shop_type(1, "Food", 1));
        db.insert_shop_type(shop_type(3, "Spa", 2));
        let (cache, types) = list_cache(&db);

        let first = types.list().await.unwrap();
        let names: Vec<_> = first.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Food", "Spa", "KTV"]);

        let second = types.list().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(db.shop_type_reads(), 1);
        assert!(cache.ttl(CACHE_SHOP_TYPE_KEY).unwrap() <= CACHE_SHOP_TYPE_TTL);
    }

    #[tokio::test]
    async fn test_empty_list_is_not_cached() {
        let db = InMemoryDatabase::new();
        let (cache, types) = list_cache(&db);

        assert!(types.list().await.unwrap().is_empty());
        assert!(cache.get(CACHE_SHOP_TYPE_KEY).await.unwrap().is_none());

        db.insert_shop_type(shop_type(1, "Food", 1));
        assert_eq!(types.list().await.unwrap().len(), 1);
        assert_eq!(db.shop_type_reads(), 2);
    }

    #[tokio::test]
    async fn test_cached_empty_array_requeries() {
        let db = InMemoryDatabase::new();
        db.insert_shop_type(shop_type(1, "Food", 1));
        let (cache, types) = list_cache(&db);
        cache.set(CACHE_SHOP_TYPE_KEY, "[]", None).await.unwrap();

        assert_eq!(types.list().await.unwrap().len(), 1);
        assert_eq!(db.shop_type_reads(), 1);
    }
}

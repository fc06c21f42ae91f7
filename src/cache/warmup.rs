//! Existence filter warm-up
//!
//! Every id the store already knows must be in the filter before the first
//! read, otherwise it would be rejected as nonexistent.

use tracing::info;

use super::filter::ExistenceFilter;
use super::KeySpace;
use crate::domain::ports::Repository;
use crate::error::Result;

/// Register every id of `repository` in `filter`. Returns the number of ids.
pub async fn warm_up_filter<T>(
    repository: &dyn Repository<T>,
    filter: &ExistenceFilter,
    keys: &KeySpace,
) -> Result<usize> {
    let ids = repository.list_ids().await?;
    if ids.is_empty() {
        info!("Filter warm-up found no shops");
        return Ok(0);
    }

    for id in &ids {
        filter.add(&keys.cache_key(*id));
    }
    info!(
        count = ids.len(),
        bits = filter.bit_count(),
        expected_fpp = filter.expected_fpp(),
        "Existence filter warmed up"
    );
    Ok(ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryDatabase;
    use crate::cache::FilterConfig;
    use crate::domain::model::Shop;

    fn filter() -> ExistenceFilter {
        ExistenceFilter::with_config(FilterConfig {
            expected_insertions: 1_000,
            false_positive_rate: 0.01,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_warm_up_registers_every_id() {
        let db = InMemoryDatabase::new();
        for id in 1..=14 {
            db.insert_shop(Shop::new(id, format!("Shop {}", id), 1));
        }
        let filter = filter();
        let keys = KeySpace::shop();

        let count = warm_up_filter::<Shop>(&db, &filter, &keys).await.unwrap();
        assert_eq!(count, 14);
        for id in 1..=14 {
            assert!(filter.might_contain(&keys.cache_key(id)));
        }
    }

    #[tokio::test]
    async fn test_warm_up_empty_store() {
        let db = InMemoryDatabase::new();
        let filter = filter();
        let count = warm_up_filter::<Shop>(&db, &filter, &KeySpace::shop())
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(filter.approximate_len(), 0);
    }

    #[tokio::test]
    async fn test_warm_up_propagates_store_faults() {
        let db = InMemoryDatabase::new();
        db.set_available(false);
        let result = warm_up_filter::<Shop>(&db, &filter(), &KeySpace::shop()).await;
        assert!(result.unwrap_err().is_storage_fault());
    }
}

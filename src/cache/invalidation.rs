use std::sync::Arc;
use tracing::Span;

use super::{tenant_key, tenant_pattern, CacheStore, SCAN_BATCH};
use crate::error::CacheError;
use crate::metrics::Metrics;

// ============================================================================
// Cache Invalidation Hook
// ============================================================================
//
// Called after a committed write and from the change-event consumer. Removes
// the entity entry and the list-level entries derived from it, all inside the
// tenant's key space. Pattern deletes scan and delete in batches of
// SCAN_BATCH keys so one call never blocks the cache on a huge KEYS.
//
// ============================================================================

pub const PRODUCT_LIST_PATTERN: &str = "products:list:*";

pub fn product_key(product_id: &str) -> String {
    format!("product:{}", product_id)
}

#[derive(Clone)]
pub struct CacheInvalidator {
    store: Arc<dyn CacheStore>,
    metrics: Option<Arc<Metrics>>,
    span: Span,
}

impl CacheInvalidator {
    pub fn new(store: Arc<dyn CacheStore>, span: Span) -> Self {
        Self {
            store,
            metrics: None,
            span,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Dispatch on the shape of `key`:
    /// empty deletes every key of the tenant, a trailing `*` is a
    /// tenant-scoped pattern, anything else is a single key.
    pub async fn invalidate(&self, key: &str, tenant: &str) -> Result<u64, CacheError> {
        if key.is_empty() {
            self.invalidate_pattern(tenant, "*").await
        } else if key.ends_with('*') {
            self.invalidate_pattern(tenant, key).await
        } else {
            self.invalidate_entity(tenant, key).await
        }
    }

    pub async fn invalidate_entity(&self, tenant: &str, key: &str) -> Result<u64, CacheError> {
        let full_key = tenant_key(tenant, key)?;
        let removed = self.store.delete(std::slice::from_ref(&full_key)).await?;
        self.record(removed);
        tracing::debug!(parent: &self.span, key = %full_key, removed = removed, "Cache entry invalidated");
        Ok(removed)
    }

    pub async fn invalidate_pattern(&self, tenant: &str, pattern: &str) -> Result<u64, CacheError> {
        let scoped = tenant_pattern(tenant, pattern)?;
        let mut cursor = 0;
        let mut pending: Vec<String> = Vec::with_capacity(SCAN_BATCH);
        let mut removed = 0;

        loop {
            let (next, keys) = self.store.scan(&scoped, cursor, SCAN_BATCH).await?;
            for key in keys {
                pending.push(key);
                if pending.len() >= SCAN_BATCH {
                    removed += self.store.delete(&pending).await?;
                    pending.clear();
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if !pending.is_empty() {
            removed += self.store.delete(&pending).await?;
        }

        self.record(removed);
        tracing::debug!(parent: &self.span, pattern = %scoped, removed = removed, "Cache pattern invalidated");
        Ok(removed)
    }

    /// Entity entry plus every cached product list page of the tenant.
    pub async fn on_product_changed(&self, tenant: &str, product_id: &str) -> Result<u64, CacheError> {
        let entity = self.invalidate_entity(tenant, &product_key(product_id)).await?;
        let lists = if tenant.is_empty() {
            0
        } else {
            self.invalidate_pattern(tenant, PRODUCT_LIST_PATTERN).await?
        };
        Ok(entity + lists)
    }

    fn record(&self, removed: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.record_invalidated(removed as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, TenantCache};
    use std::time::Duration;

    async fn seeded() -> (Arc<MemoryCache>, CacheInvalidator) {
        let cache = Arc::new(MemoryCache::new());
        for key in [
            "tenant:t1:product:1",
            "tenant:t1:product:2",
            "tenant:t1:products:list:1:20",
            "tenant:t1:products:list:2:20",
            "tenant:t2:product:1",
            "tenant:t2:products:list:1:20",
            "tenant:t1x:products:list:1:20",
        ] {
            cache.set(key, "v", Duration::ZERO).await.unwrap();
        }
        let invalidator = CacheInvalidator::new(cache.clone(), tracing::info_span!("cache-test"));
        (cache, invalidator)
    }

    #[tokio::test]
    async fn test_single_key() {
        let (cache, invalidator) = seeded().await;
        assert_eq!(invalidator.invalidate("product:1", "t1").await.unwrap(), 1);

        assert!(cache.get("tenant:t1:product:1").await.unwrap().is_none());
        assert!(cache.get("tenant:t2:product:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pattern_stays_inside_tenant() {
        let (cache, invalidator) = seeded().await;
        assert_eq!(invalidator.invalidate("products:list:*", "t1").await.unwrap(), 2);

        let keys = cache.keys().await;
        assert!(keys.contains(&"tenant:t2:products:list:1:20".to_string()));
        assert!(keys.contains(&"tenant:t1x:products:list:1:20".to_string()));
        assert!(keys.contains(&"tenant:t1:product:1".to_string()));
    }

    #[tokio::test]
    async fn test_empty_key_clears_tenant() {
        let (cache, invalidator) = seeded().await;
        assert_eq!(invalidator.invalidate("", "t1").await.unwrap(), 4);

        let keys = cache.keys().await;
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| !k.starts_with("tenant:t1:")));
    }

    #[tokio::test]
    async fn test_glob_in_tenant_id_cannot_escape() {
        let (cache, invalidator) = seeded().await;
        assert!(matches!(
            invalidator.invalidate("", "t*").await,
            Err(CacheError::InvalidKey(_))
        ));
        assert!(invalidator.invalidate("product:1", "t?").await.is_err());
        assert_eq!(cache.keys().await.len(), 7);
    }

    #[tokio::test]
    async fn test_separator_in_tenant_id_cannot_escape() {
        let (cache, invalidator) = seeded().await;
        // Written straight to the store: no valid tenant can produce this key.
        cache
            .set("tenant:t1:eu:products:list:1:20", "v", Duration::ZERO)
            .await
            .unwrap();

        assert!(matches!(
            invalidator.invalidate("", "t1:eu").await,
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(
            invalidator.on_product_changed("t1:eu", "1").await,
            Err(CacheError::InvalidKey(_))
        ));
        assert_eq!(cache.keys().await.len(), 8);

        // Only t1 can write under `tenant:t1:`.
        let cache = Arc::new(MemoryCache::new());
        let tenants = TenantCache::new(cache.clone());
        tenants.set_json("t1", "products:list:1:20", &1, Duration::ZERO).await.unwrap();
        assert!(tenants.set_json("t1:eu", "products:list:1:20", &2, Duration::ZERO).await.is_err());
        assert_eq!(cache.keys().await, vec!["tenant:t1:products:list:1:20".to_string()]);
    }

    #[tokio::test]
    async fn test_pattern_without_tenant_is_rejected() {
        let (_cache, invalidator) = seeded().await;
        assert!(invalidator.invalidate("*", "").await.is_err());
    }

    #[tokio::test]
    async fn test_large_pattern_delete_in_batches() {
        let cache = Arc::new(MemoryCache::new());
        for i in 0..345 {
            cache
                .set(&format!("tenant:t1:products:list:{}:20", i), "v", Duration::ZERO)
                .await
                .unwrap();
        }
        let invalidator = CacheInvalidator::new(cache.clone(), tracing::info_span!("cache-test"));

        assert_eq!(invalidator.invalidate_pattern("t1", PRODUCT_LIST_PATTERN).await.unwrap(), 345);
        assert!(cache.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_on_product_changed() {
        let (cache, invalidator) = seeded().await;
        assert_eq!(invalidator.on_product_changed("t1", "2").await.unwrap(), 3);

        let keys = cache.keys().await;
        assert!(keys.contains(&"tenant:t1:product:1".to_string()));
        assert!(!keys.contains(&"tenant:t1:product:2".to_string()));
    }
}

// ============================================================================
// Cache port
// ============================================================================
//
// Key-value cache with TTLs and glob-pattern scans. Keys are tenant scoped by
// prefixing `tenant:{tenant}:`; keys without a tenant are stored unprefixed.
// Tenant ids carrying the `:` separator or glob metacharacters are rejected,
// so one tenant's key or pattern can never reach into another tenant's space.
//
// ============================================================================

mod invalidation;
mod memory;
mod redis_cache;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::context::is_valid_tenant_id;
use crate::error::CacheError;

pub use invalidation::{product_key, CacheInvalidator, PRODUCT_LIST_PATTERN};
pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

/// Keys fetched per SCAN round-trip and deleted per DEL.
pub const SCAN_BATCH: usize = 100;

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// A zero `ttl` stores the value without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Returns how many of `keys` existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// One SCAN step. Returns the next cursor (0 when done) and matched keys.
    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError>;

    async fn close(&self);
}

pub fn tenant_key(tenant: &str, key: &str) -> Result<String, CacheError> {
    check_tenant(tenant)?;
    if tenant.is_empty() {
        Ok(key.to_string())
    } else {
        Ok(format!("tenant:{}:{}", tenant, key))
    }
}

/// Pattern matching `pattern` inside one tenant's key space.
pub fn tenant_pattern(tenant: &str, pattern: &str) -> Result<String, CacheError> {
    if tenant.is_empty() {
        return Err(CacheError::InvalidKey(format!(
            "pattern {:?} needs a tenant scope",
            pattern
        )));
    }
    check_tenant(tenant)?;
    Ok(format!("tenant:{}:{}", tenant, pattern))
}

fn check_tenant(tenant: &str) -> Result<(), CacheError> {
    if is_valid_tenant_id(tenant) {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(format!(
            "tenant id {:?} contains a reserved character",
            tenant
        )))
    }
}

/// JSON helpers over a shared [`CacheStore`], scoped by tenant.
#[derive(Clone)]
pub struct TenantCache {
    store: Arc<dyn CacheStore>,
}

impl TenantCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Cache-aside read. Undecodable entries count as a miss.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        tenant: &str,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        let full_key = tenant_key(tenant, key)?;
        let Some(raw) = self.store.get(&full_key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key = %full_key, error = %e, "Discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        tenant: &str,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| CacheError::Backend(format!("encode {}: {}", key, e)))?;
        let full_key = tenant_key(tenant, key)?;
        self.store.set(&full_key, &raw, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_key_prefix() {
        assert_eq!(tenant_key("t1", "product:42").unwrap(), "tenant:t1:product:42");
        assert_eq!(tenant_key("", "product:42").unwrap(), "product:42");
    }

    #[test]
    fn test_reserved_tenant_ids_are_rejected() {
        assert_eq!(
            tenant_pattern("t1", "products:list:*").unwrap(),
            "tenant:t1:products:list:*"
        );
        assert!(tenant_pattern("", "*").is_err());
        for tenant in ["acme:eu", "t*", "t?", "t[12]", "t\\", "t^"] {
            assert!(matches!(tenant_key(tenant, "product:1"), Err(CacheError::InvalidKey(_))));
            assert!(matches!(tenant_pattern(tenant, "*"), Err(CacheError::InvalidKey(_))));
        }
    }

    #[tokio::test]
    async fn test_json_round_trip_and_bad_entry_is_miss() {
        let store = Arc::new(MemoryCache::new());
        let cache = TenantCache::new(store.clone());

        cache
            .set_json("t1", "product:1", &vec![1, 2, 3], Duration::ZERO)
            .await
            .unwrap();
        let hit: Option<Vec<i32>> = cache.get_json("t1", "product:1").await.unwrap();
        assert_eq!(hit, Some(vec![1, 2, 3]));

        store
            .set("tenant:t1:product:2", "{not json", Duration::ZERO)
            .await
            .unwrap();
        let miss: Option<Vec<i32>> = cache.get_json("t1", "product:2").await.unwrap();
        assert!(miss.is_none());
    }
}

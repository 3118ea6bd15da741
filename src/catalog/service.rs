use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

use super::events::{
    ChangeEvent, MarketplaceSyncRequested, SupplierSyncRequested, MARKETPLACE_SYNC_TOPIC,
    PRODUCT_CREATED, PRODUCT_DELETED, PRODUCT_EVENTS_TOPIC, PRODUCT_UPDATED, SUPPLIER_SYNC_TOPIC,
};
use super::models::{NewProduct, PageRequest, Product, ProductPage};
use super::repository::ProductRepository;
use crate::cache::{product_key, CacheInvalidator, TenantCache};
use crate::context::{is_valid_tenant_id, RequestContext};
use crate::error::{Error, Result};
use crate::messaging::{EventPublisher, PublishOptions};
use crate::metrics::Metrics;
use crate::storage::UnitOfWorkCoordinator;

// ============================================================================
// Product Service - Write-then-Publish
// ============================================================================
//
// Mutations run inside one unit of work. Only after the commit succeeds is
// the change event published and the cache invalidated:
//
//   run(save) -> commit -> publish(product-events, key = product id)
//                       -> invalidate(product:{id}, products:list:*)
//
// A publish failure after commit is not surfaced to the caller: the write is
// durable and the event is lost. It is logged at error level and counted in
// events_lost_after_commit_total. There is no outbox.
//
// Reads are cache-aside. Cache failures degrade to a storage read.
//
// ============================================================================

pub const PRODUCT_TTL: Duration = Duration::from_secs(30 * 60);
pub const PRODUCT_LIST_TTL: Duration = Duration::from_secs(5 * 60);

fn list_key(page: PageRequest) -> String {
    format!("products:list:{}:{}", page.page, page.size)
}

#[derive(Clone)]
pub struct ProductService {
    uow: Arc<UnitOfWorkCoordinator>,
    publisher: EventPublisher,
    cache: TenantCache,
    invalidator: CacheInvalidator,
    repository: ProductRepository,
    metrics: Option<Arc<Metrics>>,
    span: Span,
}

impl ProductService {
    pub fn new(
        uow: Arc<UnitOfWorkCoordinator>,
        publisher: EventPublisher,
        cache: TenantCache,
        invalidator: CacheInvalidator,
        span: Span,
    ) -> Self {
        Self {
            uow,
            publisher,
            cache,
            invalidator,
            repository: ProductRepository,
            metrics: None,
            span,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn invalidator(&self) -> &CacheInvalidator {
        &self.invalidator
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub async fn create_product(&self, ctx: &RequestContext, input: NewProduct) -> Result<Product> {
        let tenant = require_tenant(ctx)?;
        let product = input.into_product(tenant, Utc::now());
        let repository = self.repository;

        let created = self
            .uow
            .run(ctx, move |unit| {
                Box::pin(async move {
                    repository.save(&mut *unit, &product).await?;
                    Ok(product)
                })
            })
            .await
            .inspect_err(|e| {
                tracing::error!(parent: &self.span, tenant_id = tenant, error = %e, "❌ Create product transaction failed");
            })?;

        tracing::info!(
            parent: &self.span,
            product_id = %created.id,
            tenant_id = tenant,
            "✅ Product created"
        );

        self.after_commit(ctx, PRODUCT_CREATED, &created).await;
        Ok(created)
    }

    /// Replace the product's attributes. `metadata` of `None` keeps the stored value.
    pub async fn update_product(
        &self,
        ctx: &RequestContext,
        product_id: &str,
        base_data: Value,
        metadata: Option<Value>,
    ) -> Result<Product> {
        let tenant = require_tenant(ctx)?.to_string();
        let id = product_id.to_string();
        let repository = self.repository;

        let updated = self
            .uow
            .run(ctx, move |unit| {
                Box::pin(async move {
                    let mut product = repository
                        .find(&mut *unit, &tenant, &id)
                        .await?
                        .ok_or_else(|| Error::NotFound(format!("product {}", id)))?;
                    product.base_data = base_data;
                    if metadata.is_some() {
                        product.metadata = metadata;
                    }
                    product.updated_at = Utc::now();
                    repository.save(&mut *unit, &product).await?;
                    Ok(product)
                })
            })
            .await?;

        tracing::info!(
            parent: &self.span,
            product_id = %updated.id,
            tenant_id = %updated.tenant_id,
            "✅ Product updated"
        );

        self.after_commit(ctx, PRODUCT_UPDATED, &updated).await;
        Ok(updated)
    }

    pub async fn delete_product(&self, ctx: &RequestContext, product_id: &str) -> Result<()> {
        let tenant = require_tenant(ctx)?.to_string();
        let id = product_id.to_string();
        let repository = self.repository;

        let deleted = self
            .uow
            .run(ctx, move |unit| {
                Box::pin(async move {
                    let product = repository
                        .find(&mut *unit, &tenant, &id)
                        .await?
                        .ok_or_else(|| Error::NotFound(format!("product {}", id)))?;
                    repository.delete(&mut *unit, &tenant, &id).await?;
                    Ok(product)
                })
            })
            .await?;

        tracing::info!(
            parent: &self.span,
            product_id = %deleted.id,
            tenant_id = %deleted.tenant_id,
            "🗑️ Product deleted"
        );

        self.after_commit(ctx, PRODUCT_DELETED, &deleted).await;
        Ok(())
    }

    async fn after_commit(&self, ctx: &RequestContext, event_type: &str, product: &Product) {
        let event = ChangeEvent::product(event_type, &product.tenant_id, &product.id, product.supplier_id);

        if let Err(e) = self
            .publisher
            .publish_json(ctx, PRODUCT_EVENTS_TOPIC, &event, PublishOptions::keyed(&product.id))
            .await
        {
            tracing::error!(
                parent: &self.span,
                event_type = event_type,
                product_id = %product.id,
                tenant_id = %product.tenant_id,
                error = %e,
                "❌ Write committed but change event was not published"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_event_lost(event_type);
            }
        }

        if let Err(e) = self
            .invalidator
            .on_product_changed(&product.tenant_id, &product.id)
            .await
        {
            tracing::warn!(
                parent: &self.span,
                product_id = %product.id,
                error = %e,
                "Cache invalidation after commit failed"
            );
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_product(&self, ctx: &RequestContext, product_id: &str) -> Result<Product> {
        let tenant = require_tenant(ctx)?;
        let key = product_key(product_id);

        match self.cache.get_json::<Product>(tenant, &key).await {
            Ok(Some(product)) => {
                tracing::debug!(parent: &self.span, product_id = product_id, "Product cache hit");
                return Ok(product);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(parent: &self.span, key = %key, error = %e, "Cache read failed, falling back to storage");
            }
        }

        let mut exec = self.uow.executor();
        let product = self
            .repository
            .find(exec.as_mut(), tenant, product_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("product {}", product_id)))?;

        if let Err(e) = self.cache.set_json(tenant, &key, &product, PRODUCT_TTL).await {
            tracing::warn!(parent: &self.span, key = %key, error = %e, "Failed to cache product");
        }
        Ok(product)
    }

    pub async fn list_products(&self, ctx: &RequestContext, page: PageRequest) -> Result<ProductPage> {
        let tenant = require_tenant(ctx)?;
        let page = PageRequest::new(page.page, page.size);
        let key = list_key(page);

        match self.cache.get_json::<ProductPage>(tenant, &key).await {
            Ok(Some(cached)) => return Ok(cached),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(parent: &self.span, key = %key, error = %e, "Cache read failed, falling back to storage");
            }
        }

        let mut exec = self.uow.executor();
        let listed = self.repository.list(exec.as_mut(), tenant, page).await?;

        if let Err(e) = self.cache.set_json(tenant, &key, &listed, PRODUCT_LIST_TTL).await {
            tracing::warn!(parent: &self.span, key = %key, error = %e, "Failed to cache product list");
        }
        Ok(listed)
    }

    // ========================================================================
    // Events and sync requests
    // ========================================================================

    /// Publish an ad-hoc product event. Unlike the post-commit events, a
    /// failure here is returned to the caller.
    pub async fn publish_product_event(
        &self,
        ctx: &RequestContext,
        product_id: &str,
        event_type: &str,
    ) -> Result<String> {
        let event = ChangeEvent {
            event_type: event_type.to_string(),
            tenant_id: ctx.tenant().to_string(),
            payload: json!({ "product_id": product_id }),
            timestamp: Some(Utc::now()),
        };

        let message_id = self
            .publisher
            .publish_json(ctx, PRODUCT_EVENTS_TOPIC, &event, PublishOptions::keyed(product_id))
            .await?;

        tracing::info!(
            parent: &self.span,
            event_type = event_type,
            product_id = product_id,
            "📤 Product event published"
        );
        Ok(message_id)
    }

    /// Fails with `NotFound` when the product does not exist in the tenant.
    pub async fn sync_product_to_marketplace(
        &self,
        ctx: &RequestContext,
        product_id: &str,
        marketplace_id: i64,
    ) -> Result<()> {
        let tenant = require_tenant(ctx)?;
        let mut exec = self.uow.executor();
        self.repository
            .find(exec.as_mut(), tenant, product_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("product {}", product_id)))?;

        let request = MarketplaceSyncRequested::new(tenant, product_id, marketplace_id);
        self.publisher
            .publish_json(ctx, MARKETPLACE_SYNC_TOPIC, &request, PublishOptions::keyed(product_id))
            .await?;

        tracing::info!(
            parent: &self.span,
            product_id = product_id,
            marketplace_id = marketplace_id,
            "Marketplace sync requested"
        );
        Ok(())
    }

    /// Queue a supplier import. The import itself runs elsewhere, so the
    /// number of products synced here is always 0.
    pub async fn sync_products_from_supplier(&self, ctx: &RequestContext, supplier_id: i64) -> Result<u64> {
        let tenant = require_tenant(ctx)?;
        let request = SupplierSyncRequested::new(tenant, supplier_id);
        self.publisher
            .publish_json(
                ctx,
                SUPPLIER_SYNC_TOPIC,
                &request,
                PublishOptions::keyed(supplier_id.to_string()),
            )
            .await?;

        tracing::info!(parent: &self.span, supplier_id = supplier_id, tenant_id = tenant, "Supplier sync queued");
        Ok(0)
    }

    pub async fn invalidate_cache(&self, ctx: &RequestContext, key: &str) -> Result<u64> {
        let tenant = require_tenant(ctx)?;
        Ok(self.invalidator.invalidate(key, tenant).await?)
    }
}

fn require_tenant(ctx: &RequestContext) -> Result<&str> {
    match ctx.tenant() {
        "" => Err(Error::Validation("tenant_id is required".into())),
        tenant if !is_valid_tenant_id(tenant) => Err(Error::Validation(format!(
            "tenant_id {:?} contains a reserved character",
            tenant
        ))),
        tenant => Ok(tenant),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{tenant_key, CacheStore, MemoryCache};
    use crate::messaging::MemoryBroker;
    use crate::storage::{Executor, MemoryStore, TransactionalStore};
    use crate::utils::{CircuitBreaker, CircuitBreakerConfig};

    struct Fixture {
        store: MemoryStore,
        broker: MemoryBroker,
        cache: Arc<MemoryCache>,
        metrics: Arc<Metrics>,
        service: ProductService,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let broker = MemoryBroker::new();
        let cache = Arc::new(MemoryCache::new());
        let metrics = Arc::new(Metrics::new().unwrap());

        let uow = UnitOfWorkCoordinator::new(Arc::new(store.clone()), tracing::info_span!("uow"))
            .with_metrics(metrics.clone());
        let publisher = EventPublisher::new(
            Arc::new(broker.clone()),
            CircuitBreaker::new("producer", CircuitBreakerConfig::default()),
            tracing::info_span!("publisher"),
        );
        let store_port: Arc<dyn CacheStore> = cache.clone();
        let service = ProductService::new(
            Arc::new(uow),
            publisher,
            TenantCache::new(store_port.clone()),
            CacheInvalidator::new(store_port, tracing::info_span!("invalidator")),
            tracing::info_span!("products"),
        )
        .with_metrics(metrics.clone());

        Fixture {
            store,
            broker,
            cache,
            metrics,
            service,
        }
    }

    fn lamp() -> NewProduct {
        NewProduct {
            id: Some("p1".into()),
            supplier_id: 9,
            base_data: json!({ "name": "Lamp", "price": 10 }),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_create_commits_then_publishes_keyed_event() {
        let f = fixture();
        let ctx = RequestContext::for_tenant("t1").with_trace("tr-1");

        let product = f.service.create_product(&ctx, lamp()).await.unwrap();

        assert!(f.store.document("products", "t1/p1").is_some());
        assert_eq!(f.store.stats().commits, 1);

        let sent = f.broker.messages(PRODUCT_EVENTS_TOPIC);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key.as_deref(), Some(product.id.as_str()));
        assert_eq!(sent[0].header("tenant_id"), Some("t1"));
        let event: ChangeEvent = sent[0].decode().unwrap();
        assert_eq!(event.event_type, PRODUCT_CREATED);
        assert_eq!(event.product_id(), Some("p1"));
        assert_eq!(event.payload["supplier_id"], 9);
    }

    #[tokio::test]
    async fn test_commit_survives_publish_outage() {
        let f = fixture();
        let ctx = RequestContext::for_tenant("t1");
        f.broker.set_unavailable(true);

        let product = f.service.create_product(&ctx, lamp()).await.unwrap();

        assert_eq!(product.id, "p1");
        assert!(f.store.document("products", "t1/p1").is_some());
        assert_eq!(f.store.stats().commits, 1);
        assert!(f.broker.messages(PRODUCT_EVENTS_TOPIC).is_empty());
        assert_eq!(
            f.metrics
                .events_lost_after_commit
                .with_label_values(&[PRODUCT_CREATED])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_transaction_publishes_nothing() {
        let f = fixture();
        f.store.fail_next_commit();

        let result = f.service.create_product(&RequestContext::for_tenant("t1"), lamp()).await;

        assert!(matches!(result, Err(Error::Transaction(_))));
        assert!(f.store.document("products", "t1/p1").is_none());
        assert!(f.broker.messages(PRODUCT_EVENTS_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_missing_tenant_is_rejected() {
        let f = fixture();
        let result = f.service.create_product(&RequestContext::new(), lamp()).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(f.store.stats().begins, 0);
    }

    #[tokio::test]
    async fn test_reserved_tenant_id_is_rejected() {
        let f = fixture();
        f.service.create_product(&RequestContext::for_tenant("t1"), lamp()).await.unwrap();

        for tenant in ["t1:eu", "t1/eu", "t*"] {
            let ctx = RequestContext::for_tenant(tenant);
            assert!(matches!(
                f.service.create_product(&ctx, lamp()).await,
                Err(Error::Validation(_))
            ));
            assert!(matches!(
                f.service.list_products(&ctx, PageRequest::new(1, 20)).await,
                Err(Error::Validation(_))
            ));
            assert!(matches!(
                f.service.invalidate_cache(&ctx, "").await,
                Err(Error::Validation(_))
            ));
        }
        assert_eq!(f.store.stats().begins, 1);
        assert!(f.cache.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_product_is_cache_aside() {
        let f = fixture();
        let ctx = RequestContext::for_tenant("t1");
        f.service.create_product(&ctx, lamp()).await.unwrap();

        let first = f.service.get_product(&ctx, "p1").await.unwrap();
        assert!(f.cache.get(&tenant_key("t1", "product:p1").unwrap()).await.unwrap().is_some());

        // Served from cache even after the row is gone behind the service's back.
        f.store.executor().exec(crate::storage::Statement::Delete {
            collection: "products".into(),
            key: "t1/p1".into(),
        }).await.unwrap();
        let second = f.service.get_product(&ctx, "p1").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_get_missing_product_is_not_found() {
        let f = fixture();
        let result = f.service.get_product(&RequestContext::for_tenant("t1"), "nope").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_invalidates_entity_and_lists() {
        let f = fixture();
        let ctx = RequestContext::for_tenant("t1");
        f.service.create_product(&ctx, lamp()).await.unwrap();
        f.service.get_product(&ctx, "p1").await.unwrap();
        let page = f.service.list_products(&ctx, PageRequest::new(0, 0)).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(f.cache.keys().await.len(), 2);

        let updated = f
            .service
            .update_product(&ctx, "p1", json!({ "name": "Desk lamp" }), None)
            .await
            .unwrap();

        assert_eq!(updated.base_data["name"], "Desk lamp");
        assert!(f.cache.keys().await.is_empty());
        assert_eq!(f.broker.messages(PRODUCT_EVENTS_TOPIC).len(), 2);
    }

    #[tokio::test]
    async fn test_update_missing_product_rolls_back() {
        let f = fixture();
        let result = f
            .service
            .update_product(&RequestContext::for_tenant("t1"), "nope", json!({}), None)
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(f.store.stats().rollbacks, 1);
        assert!(f.broker.messages(PRODUCT_EVENTS_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_delete_publishes_deleted_event() {
        let f = fixture();
        let ctx = RequestContext::for_tenant("t1");
        f.service.create_product(&ctx, lamp()).await.unwrap();

        f.service.delete_product(&ctx, "p1").await.unwrap();

        assert!(f.store.document("products", "t1/p1").is_none());
        let sent = f.broker.messages(PRODUCT_EVENTS_TOPIC);
        let last: ChangeEvent = sent[sent.len() - 1].decode().unwrap();
        assert_eq!(last.event_type, PRODUCT_DELETED);
    }

    #[tokio::test]
    async fn test_sync_requests_publish_to_their_topics() {
        let f = fixture();
        let ctx = RequestContext::for_tenant("t1");
        f.service.create_product(&ctx, lamp()).await.unwrap();

        f.service.sync_product_to_marketplace(&ctx, "p1", 4).await.unwrap();
        let synced = f.service.sync_products_from_supplier(&ctx, 9).await.unwrap();
        assert_eq!(synced, 0);

        let marketplace: MarketplaceSyncRequested =
            f.broker.messages(MARKETPLACE_SYNC_TOPIC)[0].decode().unwrap();
        assert_eq!(marketplace.event_type, "product_marketplace_sync");
        assert_eq!(marketplace.marketplace_id, 4);

        let supplier: SupplierSyncRequested = f.broker.messages(SUPPLIER_SYNC_TOPIC)[0].decode().unwrap();
        assert_eq!(supplier.event_type, "supplier_sync_requested");
        assert_eq!(supplier.supplier_id, 9);

        let missing = f.service.sync_product_to_marketplace(&ctx, "nope", 4).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_publish_product_event_surfaces_failures() {
        let f = fixture();
        f.broker.set_unavailable(true);
        let result = f
            .service
            .publish_product_event(&RequestContext::for_tenant("t1"), "p1", PRODUCT_UPDATED)
            .await;
        assert!(result.is_err());
    }
}

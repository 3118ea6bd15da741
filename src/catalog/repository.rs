use super::models::{PageRequest, Product, ProductPage};
use crate::context::is_valid_tenant_id;
use crate::error::StorageError;
use crate::storage::{Executor, Lookup, Statement};

// ============================================================================
// Product Repository
// ============================================================================
//
// Products are documents in the `products` collection, keyed `{tenant}/{id}`
// so a tenant's listing is a single prefix lookup. Tenant ids containing the
// `/` separator are refused, otherwise tenant `a` would list the products of
// tenant `a/b`. Every method takes the
// executor from the caller: the pool executor for reads, the open unit of
// work for writes.
//
// ============================================================================

pub const PRODUCTS_COLLECTION: &str = "products";

#[derive(Debug, Clone, Copy, Default)]
pub struct ProductRepository;

impl ProductRepository {
    fn key(tenant_id: &str, product_id: &str) -> Result<String, StorageError> {
        Ok(format!("{}{}", Self::tenant_prefix(tenant_id)?, product_id))
    }

    fn tenant_prefix(tenant_id: &str) -> Result<String, StorageError> {
        if tenant_id.is_empty() || !is_valid_tenant_id(tenant_id) {
            return Err(StorageError::InvalidKey(format!(
                "tenant id {:?} cannot scope a product key",
                tenant_id
            )));
        }
        Ok(format!("{}/", tenant_id))
    }

    pub async fn save(&self, exec: &mut dyn Executor, product: &Product) -> Result<(), StorageError> {
        let document = serde_json::to_value(product).map_err(|e| StorageError::MalformedRow {
            collection: PRODUCTS_COLLECTION.to_string(),
            reason: e.to_string(),
        })?;
        exec.exec(Statement::Upsert {
            collection: PRODUCTS_COLLECTION.to_string(),
            key: Self::key(&product.tenant_id, &product.id)?,
            document,
        })
        .await?;
        Ok(())
    }

    pub async fn find(
        &self,
        exec: &mut dyn Executor,
        tenant_id: &str,
        product_id: &str,
    ) -> Result<Option<Product>, StorageError> {
        let rows = exec
            .query(Lookup::Key {
                collection: PRODUCTS_COLLECTION.to_string(),
                key: Self::key(tenant_id, product_id)?,
            })
            .await?;
        rows.rows
            .first()
            .map(|row| row.decode(PRODUCTS_COLLECTION))
            .transpose()
    }

    /// Returns whether a row was removed.
    pub async fn delete(
        &self,
        exec: &mut dyn Executor,
        tenant_id: &str,
        product_id: &str,
    ) -> Result<bool, StorageError> {
        let affected = exec
            .exec(Statement::Delete {
                collection: PRODUCTS_COLLECTION.to_string(),
                key: Self::key(tenant_id, product_id)?,
            })
            .await?;
        Ok(affected > 0)
    }

    pub async fn list(
        &self,
        exec: &mut dyn Executor,
        tenant_id: &str,
        page: PageRequest,
    ) -> Result<ProductPage, StorageError> {
        let rows = exec
            .query(Lookup::Prefix {
                collection: PRODUCTS_COLLECTION.to_string(),
                prefix: Self::tenant_prefix(tenant_id)?,
                offset: page.offset(),
                limit: Some(page.size as u64),
            })
            .await?;
        let products = rows
            .rows
            .iter()
            .map(|row| row.decode(PRODUCTS_COLLECTION))
            .collect::<Result<Vec<Product>, _>>()?;
        Ok(ProductPage {
            products,
            total: rows.total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::NewProduct;
    use crate::storage::{MemoryStore, TransactionalStore};
    use chrono::Utc;
    use serde_json::json;

    fn product(tenant: &str, id: &str) -> Product {
        NewProduct {
            id: Some(id.into()),
            supplier_id: 1,
            base_data: json!({ "name": id }),
            metadata: None,
        }
        .into_product(tenant, Utc::now())
    }

    #[tokio::test]
    async fn test_save_find_delete() {
        let store = MemoryStore::new();
        let mut exec = store.executor();
        let repo = ProductRepository;

        repo.save(exec.as_mut(), &product("t1", "p1")).await.unwrap();

        let found = repo.find(exec.as_mut(), "t1", "p1").await.unwrap();
        assert_eq!(found.map(|p| p.id), Some("p1".to_string()));
        assert!(repo.find(exec.as_mut(), "t2", "p1").await.unwrap().is_none());

        assert!(repo.delete(exec.as_mut(), "t1", "p1").await.unwrap());
        assert!(!repo.delete(exec.as_mut(), "t1", "p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_is_tenant_scoped_and_paged() {
        let store = MemoryStore::new();
        let mut exec = store.executor();
        let repo = ProductRepository;

        for i in 0..25 {
            repo.save(exec.as_mut(), &product("t1", &format!("p{:02}", i))).await.unwrap();
        }
        repo.save(exec.as_mut(), &product("t10", "other")).await.unwrap();

        // `t1/x` would file its products under the `t1/` prefix.
        assert!(matches!(
            repo.save(exec.as_mut(), &product("t1/x", "leak")).await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(repo.list(exec.as_mut(), "t1/x", PageRequest::new(1, 20)).await.is_err());
        assert!(repo.find(exec.as_mut(), "t1/x", "leak").await.is_err());

        let page = repo.list(exec.as_mut(), "t1", PageRequest::new(2, 20)).await.unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.products.len(), 5);
        assert_eq!(page.products[0].id, "p20");
        assert!(page.products.iter().all(|p| p.tenant_id == "t1"));

        let all = repo.list(exec.as_mut(), "t1", PageRequest::new(1, 100)).await.unwrap();
        assert!(all.products.iter().all(|p| p.id != "leak"));
    }
}

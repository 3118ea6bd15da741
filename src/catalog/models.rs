use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Product Models
// ============================================================================

/// A supplier product as stored in the catalog. `base_data` holds the common
/// attributes (name, description, price), `metadata` supplier-specific ones.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Product {
    pub id: String,
    pub tenant_id: String,
    pub supplier_id: i64,
    pub base_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a product. A missing id is generated.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct NewProduct {
    #[serde(default)]
    pub id: Option<String>,
    pub supplier_id: i64,
    pub base_data: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl NewProduct {
    pub fn into_product(self, tenant_id: &str, now: DateTime<Utc>) -> Product {
        Product {
            id: self
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            tenant_id: tenant_id.to_string(),
            supplier_id: self.supplier_id,
            base_data: self.base_data,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    /// Page starts at 1; size defaults to 20 and is capped at 100.
    pub fn new(page: u32, size: u32) -> Self {
        let size = match size {
            0 => DEFAULT_PAGE_SIZE,
            s => s.min(MAX_PAGE_SIZE),
        };
        Self {
            page: page.max(1),
            size,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.size as u64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProductPage {
    pub products: Vec<Product>,
    pub total: u64,
}

// ============================================================================
// Unit Tests
// ============================================================================

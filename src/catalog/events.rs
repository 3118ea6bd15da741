use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// Catalog Events - Published after a write commits
// ============================================================================

pub const PRODUCT_EVENTS_TOPIC: &str = "product-events";
pub const PRODUCT_COMMANDS_TOPIC: &str = "product-commands";
pub const MARKETPLACE_SYNC_TOPIC: &str = "marketplace-sync";
pub const SUPPLIER_SYNC_TOPIC: &str = "supplier-sync";

pub const PRODUCT_CREATED: &str = "product_created";
pub const PRODUCT_UPDATED: &str = "product_updated";
pub const PRODUCT_DELETED: &str = "product_deleted";
pub const PRODUCT_PRICE_UPDATED: &str = "product_price_updated";
pub const PRODUCT_INVENTORY_UPDATED: &str = "product_inventory_updated";

/// Envelope on `product-events`. `payload` stays loosely typed because price
/// and inventory events carry different fields than lifecycle events.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub event_type: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn product(event_type: &str, tenant_id: &str, product_id: &str, supplier_id: i64) -> Self {
        Self {
            event_type: event_type.to_string(),
            tenant_id: tenant_id.to_string(),
            payload: json!({
                "product_id": product_id,
                "supplier_id": supplier_id,
            }),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn product_id(&self) -> Option<&str> {
        self.payload
            .get("product_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MarketplaceSyncRequested {
    pub event_type: String,
    pub tenant_id: String,
    pub product_id: String,
    pub marketplace_id: i64,
    pub timestamp: DateTime<Utc>,
}

impl MarketplaceSyncRequested {
    pub fn new(tenant_id: &str, product_id: &str, marketplace_id: i64) -> Self {
        Self {
            event_type: "product_marketplace_sync".to_string(),
            tenant_id: tenant_id.to_string(),
            product_id: product_id.to_string(),
            marketplace_id,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SupplierSyncRequested {
    pub event_type: String,
    pub tenant_id: String,
    pub supplier_id: i64,
    pub timestamp: DateTime<Utc>,
}

impl SupplierSyncRequested {
    pub fn new(tenant_id: &str, supplier_id: i64) -> Self {
        Self {
            event_type: "supplier_sync_requested".to_string(),
            tenant_id: tenant_id.to_string(),
            supplier_id,
            timestamp: Utc::now(),
        }
    }
}

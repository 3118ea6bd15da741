use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// ============================================================================
// Catalog Commands - Represent requested work, consumed from product-commands
// ============================================================================

pub const SYNC_PRODUCTS_FROM_SUPPLIER: &str = "sync_products_from_supplier";
pub const SYNC_PRODUCT_TO_MARKETPLACE: &str = "sync_product_to_marketplace";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CommandEnvelope {
    pub command_type: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProductCommand {
    SyncProductsFromSupplier {
        supplier_id: i64,
    },
    SyncProductToMarketplace {
        product_id: String,
        marketplace_id: i64,
    },
}

impl ProductCommand {
    /// `Ok(None)` for command types this service does not handle. Known
    /// types with malformed fields are permanent decode errors.
    pub fn parse(envelope: &CommandEnvelope) -> Result<Option<Self>> {
        let command = match envelope.command_type.as_str() {
            SYNC_PRODUCTS_FROM_SUPPLIER => ProductCommand::SyncProductsFromSupplier {
                supplier_id: int_field(&envelope.payload, "supplier_id")?,
            },
            SYNC_PRODUCT_TO_MARKETPLACE => ProductCommand::SyncProductToMarketplace {
                product_id: envelope
                    .payload
                    .get("product_id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| Error::PermanentDecode("invalid product_id".into()))?
                    .to_string(),
                marketplace_id: int_field(&envelope.payload, "marketplace_id")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

// JSON producers may send ids as floats (e.g. 7.0).
fn int_field(payload: &Value, name: &str) -> Result<i64> {
    let value = payload.get(name);
    value
        .and_then(Value::as_i64)
        .or_else(|| {
            value
                .and_then(Value::as_f64)
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64)
        })
        .ok_or_else(|| Error::PermanentDecode(format!("invalid {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(command_type: &str, payload: Value) -> CommandEnvelope {
        CommandEnvelope {
            command_type: command_type.into(),
            tenant_id: "t1".into(),
            payload,
        }
    }

    #[test]
    fn test_parse_supplier_sync_accepts_float_ids() {
        let parsed = ProductCommand::parse(&envelope(
            SYNC_PRODUCTS_FROM_SUPPLIER,
            json!({ "supplier_id": 7.0 }),
        ))
        .unwrap();
        assert_eq!(parsed, Some(ProductCommand::SyncProductsFromSupplier { supplier_id: 7 }));
    }

    #[test]
    fn test_parse_marketplace_sync() {
        let parsed = ProductCommand::parse(&envelope(
            SYNC_PRODUCT_TO_MARKETPLACE,
            json!({ "product_id": "p1", "marketplace_id": 3 }),
        ))
        .unwrap();
        assert_eq!(
            parsed,
            Some(ProductCommand::SyncProductToMarketplace {
                product_id: "p1".into(),
                marketplace_id: 3
            })
        );
    }

    #[test]
    fn test_malformed_field_is_permanent() {
        let result = ProductCommand::parse(&envelope(
            SYNC_PRODUCT_TO_MARKETPLACE,
            json!({ "product_id": 12 }),
        ));
        assert!(matches!(result, Err(Error::PermanentDecode(_))));
    }

    #[test]
    fn test_unknown_command_is_ignored() {
        let parsed = ProductCommand::parse(&envelope("reindex_everything", json!({}))).unwrap();
        assert_eq!(parsed, None);
    }
}

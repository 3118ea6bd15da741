// ============================================================================
// catalog_events - event delivery and write coordination for the catalog
// ============================================================================
//
// Layers, bottom-up:
// - storage:   transactional store port, unit-of-work coordinator
// - messaging: broker port, event publisher, subscription manager + DLQ
// - cache:     tenant-scoped cache port and invalidation hook
// - catalog:   products on top of the three (write-then-publish, worker)
//
// Ambient: error taxonomy, typed request context, env config, prometheus
// metrics, retry and circuit breaker utilities.
//
// ============================================================================

pub mod cache;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod messaging;
pub mod metrics;
pub mod storage;
pub mod utils;

pub use context::RequestContext;
pub use error::{Error, Result};

// ============================================================================
// Catalog Domain - Products on top of the event core
// ============================================================================
//
// This module contains the product-specific code that drives the core:
// - Models (Product, NewProduct, PageRequest, ProductPage)
// - Events (change events published after commit, sync requests)
// - Commands (sync commands consumed by the worker)
// - Repository (document persistence over any Executor)
// - Service (write-then-publish, cache-aside reads)
// - Worker (command and event subscriptions)
//
// ============================================================================

pub mod commands;
pub mod events;
pub mod models;
pub mod repository;
pub mod service;
pub mod worker;

// Re-export for convenience
pub use commands::*;
pub use events::*;
pub use models::*;
pub use service::*;
pub use worker::*;

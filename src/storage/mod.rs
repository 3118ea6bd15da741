// ============================================================================
// Storage Port
// ============================================================================
//
// The storage engine is an external transactional document store. The core
// only needs two things from it:
//
// - An `Executor` (exec + query). Both the pool and an open transaction
//   implement it, so repositories take `&mut dyn Executor` and never care
//   which one they were handed.
// - `TransactionalStore::begin`, which hands out a `StoreTransaction` that the
//   unit-of-work coordinator commits or rolls back exactly once.
//
// A transaction dropped without commit or rollback must discard its writes.
//
// ============================================================================

mod memory;
mod postgres;
mod unit_of_work;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::StorageError;

pub use memory::{MemoryStore, StoreStats};
pub use postgres::PostgresStore;
pub use unit_of_work::{UnitFuture, UnitOfWork, UnitOfWorkCoordinator, UnitState};

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Upsert {
        collection: String,
        key: String,
        document: Value,
    },
    Delete {
        collection: String,
        key: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Key {
        collection: String,
        key: String,
    },
    /// Keys starting with `prefix`, ordered by key.
    Prefix {
        collection: String,
        prefix: String,
        offset: u64,
        limit: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: String,
    pub document: Value,
}

impl Row {
    pub fn decode<T: DeserializeOwned>(&self, collection: &str) -> Result<T, StorageError> {
        serde_json::from_value(self.document.clone()).map_err(|e| StorageError::MalformedRow {
            collection: collection.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Page of rows plus the number of rows matching the lookup without paging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    pub rows: Vec<Row>,
    pub total: u64,
}

#[async_trait]
pub trait Executor: Send {
    /// Apply a write; returns affected rows.
    async fn exec(&mut self, statement: Statement) -> Result<u64, StorageError>;

    async fn query(&mut self, lookup: Lookup) -> Result<Rows, StorageError>;
}

#[async_trait]
pub trait StoreTransaction: Executor {
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError>;

    /// Autocommit executor backed by the shared pool.
    fn executor(&self) -> Box<dyn Executor>;

    async fn close(&self);
}

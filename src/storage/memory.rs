use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Executor, Lookup, Row, Rows, Statement, StoreTransaction, TransactionalStore};
use crate::error::StorageError;

// ============================================================================
// In-memory transactional store
// ============================================================================
//
// Backs CATALOG_BACKEND=memory and the test suite. A transaction works on a
// private copy of the tables and replays its staged statements onto the shared
// tables on commit. Dropping an unfinished transaction counts as a rollback.
//
// ============================================================================

type Tables = BTreeMap<(String, String), Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

#[derive(Default)]
struct StoreState {
    tables: Tables,
    stats: StoreStats,
    fail_next_begin: bool,
    fail_next_commit: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

fn lock(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        lock(&self.state).stats
    }

    pub fn document(&self, collection: &str, key: &str) -> Option<Value> {
        lock(&self.state)
            .tables
            .get(&(collection.to_string(), key.to_string()))
            .cloned()
    }

    pub fn fail_next_begin(&self) {
        lock(&self.state).fail_next_begin = true;
    }

    pub fn fail_next_commit(&self) {
        lock(&self.state).fail_next_commit = true;
    }
}

fn apply(tables: &mut Tables, statement: &Statement) -> u64 {
    match statement {
        Statement::Upsert {
            collection,
            key,
            document,
        } => {
            tables.insert((collection.clone(), key.clone()), document.clone());
            1
        }
        Statement::Delete { collection, key } => {
            tables.remove(&(collection.clone(), key.clone())).map_or(0, |_| 1)
        }
    }
}

fn select(tables: &Tables, lookup: &Lookup) -> Rows {
    match lookup {
        Lookup::Key { collection, key } => {
            let rows: Vec<Row> = tables
                .get(&(collection.clone(), key.clone()))
                .map(|document| Row {
                    key: key.clone(),
                    document: document.clone(),
                })
                .into_iter()
                .collect();
            Rows {
                total: rows.len() as u64,
                rows,
            }
        }
        Lookup::Prefix {
            collection,
            prefix,
            offset,
            limit,
        } => {
            let matching: Vec<Row> = tables
                .range((collection.clone(), prefix.clone())..)
                .take_while(|((c, k), _)| c == collection && k.starts_with(prefix.as_str()))
                .map(|((_, k), document)| Row {
                    key: k.clone(),
                    document: document.clone(),
                })
                .collect();
            let total = matching.len() as u64;
            let rows = matching
                .into_iter()
                .skip(*offset as usize)
                .take(limit.map_or(usize::MAX, |l| l as usize))
                .collect();
            Rows { rows, total }
        }
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_next_begin) {
            return Err(StorageError::Connection("injected begin failure".into()));
        }
        state.stats.begins += 1;
        Ok(Box::new(MemoryTransaction {
            working: state.tables.clone(),
            staged: Vec::new(),
            state: self.state.clone(),
            finished: false,
        }))
    }

    fn executor(&self) -> Box<dyn Executor> {
        Box::new(MemoryExecutor {
            state: self.state.clone(),
        })
    }

    async fn close(&self) {}
}

struct MemoryExecutor {
    state: Arc<Mutex<StoreState>>,
}

#[async_trait]
impl Executor for MemoryExecutor {
    async fn exec(&mut self, statement: Statement) -> Result<u64, StorageError> {
        Ok(apply(&mut lock(&self.state).tables, &statement))
    }

    async fn query(&mut self, lookup: Lookup) -> Result<Rows, StorageError> {
        Ok(select(&lock(&self.state).tables, &lookup))
    }
}

struct MemoryTransaction {
    working: Tables,
    staged: Vec<Statement>,
    state: Arc<Mutex<StoreState>>,
    finished: bool,
}

#[async_trait]
impl Executor for MemoryTransaction {
    async fn exec(&mut self, statement: Statement) -> Result<u64, StorageError> {
        let affected = apply(&mut self.working, &statement);
        self.staged.push(statement);
        Ok(affected)
    }

    async fn query(&mut self, lookup: Lookup) -> Result<Rows, StorageError> {
        Ok(select(&self.working, &lookup))
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_next_commit) {
            state.stats.rollbacks += 1;
            return Err(StorageError::Connection("injected commit failure".into()));
        }
        for statement in &self.staged {
            apply(&mut state.tables, statement);
        }
        state.stats.commits += 1;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        lock(&self.state).stats.rollbacks += 1;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            lock(&self.state).stats.rollbacks += 1;
        }
    }
}

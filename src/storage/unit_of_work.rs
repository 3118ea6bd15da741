use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::Span;
use uuid::Uuid;

use super::{Executor, Lookup, Rows, Statement, StoreTransaction, TransactionalStore};
use crate::context::RequestContext;
use crate::error::{Result, StorageError, TransactionError};
use crate::metrics::Metrics;

// ============================================================================
// Unit of Work
// ============================================================================
//
// `UnitOfWorkCoordinator::run` executes a closure against one open
// transaction and guarantees a single terminal outcome:
//
// - closure Ok          -> commit; a failed commit is returned to the caller
// - closure Err         -> rollback; the closure's error is returned and a
//                          rollback failure is only logged
// - closure panics or
//   the future is dropped -> the open transaction is dropped, which rolls back
//
// The unit is passed to the closure explicitly. Nesting `run` on the same task
// while a unit is open is rejected with `TransactionError::Nested`; callers
// that want to share a transaction pass the open `UnitOfWork` down instead.
//
// ============================================================================

tokio::task_local! {
    static ACTIVE_UNIT: Uuid;
}

pub type UnitFuture<'u, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'u>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Open,
    Committed,
    RolledBack,
}

/// One open transaction. Implements [`Executor`] so repositories accept it in
/// place of the pool executor.
pub struct UnitOfWork {
    id: Uuid,
    ctx: RequestContext,
    state: UnitState,
    tx: Option<Box<dyn StoreTransaction>>,
    span: Span,
    metrics: Option<Arc<Metrics>>,
}

impl UnitOfWork {
    fn open(tx: Box<dyn StoreTransaction>, ctx: RequestContext, span: Span, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ctx,
            state: UnitState::Open,
            tx: Some(tx),
            span,
            metrics,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub(crate) async fn commit(&mut self) -> std::result::Result<(), TransactionError> {
        let tx = self.tx.take().ok_or(TransactionError::Closed(self.id))?;
        match tx.commit().await {
            Ok(()) => {
                self.state = UnitState::Committed;
                self.record("committed");
                tracing::debug!(parent: &self.span, unit_id = %self.id, "Unit of work committed");
                Ok(())
            }
            Err(e) => {
                self.state = UnitState::RolledBack;
                self.record("commit_failed");
                tracing::error!(parent: &self.span, unit_id = %self.id, error = %e, "❌ Commit failed");
                Err(TransactionError::Commit(e))
            }
        }
    }

    pub(crate) async fn rollback(&mut self) -> std::result::Result<(), TransactionError> {
        let tx = self.tx.take().ok_or(TransactionError::Closed(self.id))?;
        self.state = UnitState::RolledBack;
        self.record("rolled_back");
        tx.rollback().await.map_err(TransactionError::Rollback)
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_unit_of_work(outcome);
        }
    }

    fn tx_mut(&mut self) -> std::result::Result<&mut Box<dyn StoreTransaction>, StorageError> {
        self.tx.as_mut().ok_or(StorageError::Finished)
    }
}

#[async_trait]
impl Executor for UnitOfWork {
    async fn exec(&mut self, statement: Statement) -> std::result::Result<u64, StorageError> {
        self.tx_mut()?.exec(statement).await
    }

    async fn query(&mut self, lookup: Lookup) -> std::result::Result<Rows, StorageError> {
        self.tx_mut()?.query(lookup).await
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.state = UnitState::RolledBack;
            self.record("abandoned");
            tracing::warn!(
                parent: &self.span,
                unit_id = %self.id,
                "⚠️ Unit of work dropped while open, rolling back"
            );
            drop(tx);
        }
    }
}

pub struct UnitOfWorkCoordinator {
    store: Arc<dyn TransactionalStore>,
    metrics: Option<Arc<Metrics>>,
    span: Span,
}

impl UnitOfWorkCoordinator {
    pub fn new(store: Arc<dyn TransactionalStore>, span: Span) -> Self {
        Self {
            store,
            metrics: None,
            span,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Autocommit executor for reads and single-statement writes.
    pub fn executor(&self) -> Box<dyn Executor> {
        self.store.executor()
    }

    pub(crate) async fn begin(&self, ctx: &RequestContext) -> Result<UnitOfWork> {
        let tx = self.store.begin().await.map_err(|e| {
            tracing::error!(parent: &self.span, error = %e, "❌ Failed to begin transaction");
            TransactionError::Begin(e)
        })?;
        Ok(UnitOfWork::open(
            tx,
            ctx.clone(),
            self.span.clone(),
            self.metrics.clone(),
        ))
    }

    /// Run `work` inside one transaction. The closure's future may borrow the
    /// unit but must own everything else it touches.
    pub async fn run<T, F>(&self, ctx: &RequestContext, work: F) -> Result<T>
    where
        T: Send,
        F: for<'u> FnOnce(&'u mut UnitOfWork) -> UnitFuture<'u, T> + Send,
    {
        if let Ok(open) = ACTIVE_UNIT.try_with(|id| *id) {
            return Err(TransactionError::Nested(open).into());
        }

        let mut unit = self.begin(ctx).await?;
        let unit_id = unit.id();

        let outcome = ACTIVE_UNIT.scope(unit_id, work(&mut unit)).await;

        match outcome {
            Ok(value) => {
                unit.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = unit.rollback().await {
                    tracing::warn!(
                        parent: &self.span,
                        unit_id = %unit_id,
                        error = %rollback_err,
                        "Rollback failed after unit of work error"
                    );
                }
                tracing::debug!(parent: &self.span, unit_id = %unit_id, error = %err, "Unit of work rolled back");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn coordinator(store: &MemoryStore) -> UnitOfWorkCoordinator {
        UnitOfWorkCoordinator::new(Arc::new(store.clone()), tracing::info_span!("uow-test"))
    }

    fn upsert(key: &str) -> Statement {
        Statement::Upsert {
            collection: "products".into(),
            key: key.into(),
            document: json!({ "name": key }),
        }
    }

    #[tokio::test]
    async fn test_run_commits_on_success() {
        let store = MemoryStore::new();
        let uow = coordinator(&store);

        let value = uow
            .run(&RequestContext::for_tenant("t1"), |unit| {
                Box::pin(async move {
                    unit.exec(upsert("t1/a")).await?;
                    unit.exec(upsert("t1/b")).await?;
                    Ok(42)
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(store.document("products", "t1/a").is_some());
        assert!(store.document("products", "t1/b").is_some());
        assert_eq!(store.stats(), crate::storage::StoreStats { begins: 1, commits: 1, rollbacks: 0 });
    }

    #[tokio::test]
    async fn test_run_rolls_back_and_returns_work_error() {
        let store = MemoryStore::new();
        let uow = coordinator(&store);

        let result: Result<()> = uow
            .run(&RequestContext::new(), |unit| {
                Box::pin(async move {
                    unit.exec(upsert("t1/a")).await?;
                    Err(Error::Validation("price must be positive".into()))
                })
            })
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(store.document("products", "t1/a").is_none());
        assert_eq!(store.stats().commits, 0);
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_commit_failure_is_returned() {
        let store = MemoryStore::new();
        store.fail_next_commit();
        let uow = coordinator(&store);

        let result = uow
            .run(&RequestContext::new(), |unit| {
                Box::pin(async move {
                    unit.exec(upsert("t1/a")).await?;
                    Ok(())
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(Error::Transaction(TransactionError::Commit(_)))
        ));
        assert!(store.document("products", "t1/a").is_none());
    }

    #[tokio::test]
    async fn test_begin_failure_never_runs_work() {
        let store = MemoryStore::new();
        store.fail_next_begin();
        let uow = coordinator(&store);
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = ran.clone();

        let result = uow
            .run(&RequestContext::new(), move |_unit| {
                Box::pin(async move {
                    ran_clone.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(Error::Transaction(TransactionError::Begin(_)))
        ));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_in_work_rolls_back() {
        let store = MemoryStore::new();
        let uow = Arc::new(coordinator(&store));

        let task_uow = uow.clone();
        let joined = tokio::spawn(async move {
            task_uow
                .run(&RequestContext::new(), |unit| {
                    Box::pin(async move {
                        unit.exec(upsert("t1/a")).await?;
                        if unit.id() != Uuid::nil() {
                            panic!("handler bug");
                        }
                        Ok(())
                    })
                })
                .await
        })
        .await;

        assert!(joined.is_err());
        assert!(store.document("products", "t1/a").is_none());
        assert_eq!(store.stats().commits, 0);
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_nested_run_is_rejected() {
        let store = MemoryStore::new();
        let uow = Arc::new(coordinator(&store));
        let inner = uow.clone();

        let result = uow
            .run(&RequestContext::new(), move |_unit| {
                Box::pin(async move {
                    let nested = inner
                        .run(&RequestContext::new(), |_| Box::pin(async { Ok(()) }))
                        .await;
                    assert!(matches!(
                        nested,
                        Err(Error::Transaction(TransactionError::Nested(_)))
                    ));
                    Ok(())
                })
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(store.stats().begins, 1);
    }

    #[tokio::test]
    async fn test_unit_state_after_commit() {
        let store = MemoryStore::new();
        let uow = coordinator(&store);
        let mut unit = uow.begin(&RequestContext::new()).await.unwrap();

        assert_eq!(unit.state(), UnitState::Open);
        unit.commit().await.unwrap();
        assert_eq!(unit.state(), UnitState::Committed);

        assert!(matches!(unit.rollback().await, Err(TransactionError::Closed(_))));
        assert!(matches!(unit.exec(upsert("t1/a")).await, Err(StorageError::Finished)));
    }
}

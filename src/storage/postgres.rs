use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;

use super::{Executor, Lookup, Row, Rows, Statement, StoreTransaction, TransactionalStore};
use crate::error::StorageError;

// ============================================================================
// PostgreSQL document store
// ============================================================================
//
// Every collection lives in one JSONB table keyed by (collection, key):
//
//   catalog_documents(collection TEXT, key TEXT, document JSONB, updated_at)
//
// The pool executor runs each statement in its own implicit transaction.
// `begin` checks out a connection and holds it for the transaction lifetime;
// sqlx rolls the transaction back if it is dropped unfinished.
//
// ============================================================================

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS catalog_documents (
    collection  TEXT        NOT NULL,
    key         TEXT        NOT NULL,
    document    JSONB       NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (collection, key)
)"#;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        tracing::info!(max_connections = max_connections, "✅ Connected to PostgreSQL");
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

async fn exec_on(conn: &mut PgConnection, statement: Statement) -> Result<u64, StorageError> {
    let result = match statement {
        Statement::Upsert {
            collection,
            key,
            document,
        } => {
            sqlx::query(
                "INSERT INTO catalog_documents (collection, key, document, updated_at)
                 VALUES ($1, $2, $3, now())
                 ON CONFLICT (collection, key)
                 DO UPDATE SET document = EXCLUDED.document, updated_at = now()",
            )
            .bind(collection)
            .bind(key)
            .bind(document)
            .execute(&mut *conn)
            .await?
        }
        Statement::Delete { collection, key } => {
            sqlx::query("DELETE FROM catalog_documents WHERE collection = $1 AND key = $2")
                .bind(collection)
                .bind(key)
                .execute(&mut *conn)
                .await?
        }
    };
    Ok(result.rows_affected())
}

async fn query_on(conn: &mut PgConnection, lookup: Lookup) -> Result<Rows, StorageError> {
    match lookup {
        Lookup::Key { collection, key } => {
            let found: Option<(String, Value)> = sqlx::query_as(
                "SELECT key, document FROM catalog_documents WHERE collection = $1 AND key = $2",
            )
            .bind(collection)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;

            let rows: Vec<Row> = found
                .into_iter()
                .map(|(key, document)| Row { key, document })
                .collect();
            Ok(Rows {
                total: rows.len() as u64,
                rows,
            })
        }
        Lookup::Prefix {
            collection,
            prefix,
            offset,
            limit,
        } => {
            let total: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM catalog_documents
                 WHERE collection = $1 AND starts_with(key, $2)",
            )
            .bind(&collection)
            .bind(&prefix)
            .fetch_one(&mut *conn)
            .await?;

            // LIMIT NULL means no limit in PostgreSQL.
            let found: Vec<(String, Value)> = sqlx::query_as(
                "SELECT key, document FROM catalog_documents
                 WHERE collection = $1 AND starts_with(key, $2)
                 ORDER BY key
                 OFFSET $3 LIMIT $4",
            )
            .bind(&collection)
            .bind(&prefix)
            .bind(offset as i64)
            .bind(limit.map(|l| l as i64))
            .fetch_all(&mut *conn)
            .await?;

            Ok(Rows {
                rows: found
                    .into_iter()
                    .map(|(key, document)| Row { key, document })
                    .collect(),
                total: total.max(0) as u64,
            })
        }
    }
}

#[async_trait]
impl TransactionalStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    fn executor(&self) -> Box<dyn Executor> {
        Box::new(PgPoolExecutor {
            pool: self.pool.clone(),
        })
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
    }
}

struct PgPoolExecutor {
    pool: PgPool,
}

#[async_trait]
impl Executor for PgPoolExecutor {
    async fn exec(&mut self, statement: Statement) -> Result<u64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        exec_on(&mut conn, statement).await
    }

    async fn query(&mut self, lookup: Lookup) -> Result<Rows, StorageError> {
        let mut conn = self.pool.acquire().await?;
        query_on(&mut conn, lookup).await
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Executor for PgTransaction {
    async fn exec(&mut self, statement: Statement) -> Result<u64, StorageError> {
        exec_on(&mut self.tx, statement).await
    }

    async fn query(&mut self, lookup: Lookup) -> Result<Rows, StorageError> {
        query_on(&mut self.tx, lookup).await
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

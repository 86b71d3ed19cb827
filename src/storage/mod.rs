//! Storage Adapter (§4.A) — abstracts a relational store, a KV store, and an
//! object store so every other component is storage-agnostic. No SQL leaks
//! past this boundary; callers work with [`StorageError`].

pub mod error;
pub mod kv;
pub mod object;

pub use error::{StorageError, StorageResult};
pub use kv::KvStore;
pub use object::ObjectStore;

use sqlx::PgPool;

/// The relational half of the adapter. Thin wrapper over `PgPool` — `exec`/
/// `query`/`batch` are expressed directly with `sqlx` at call sites (its
/// query builder already gives the abstraction §4.A asks for); this type
/// exists to hold the pool and the `transaction` helper multi-row mutations
/// (resolver, dashboard) need.
#[derive(Clone)]
pub struct RelationalStore {
    pub pool: PgPool,
}

impl RelationalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run `f` inside a transaction, committing on `Ok` and rolling back on
    /// `Err`. Callers needing read-of-head-then-append semantics (the ledger)
    /// acquire their own row lock inside `f`.
    pub async fn transaction<F, Fut, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(sqlx::Transaction<'static, sqlx::Postgres>) -> Fut + Send,
        Fut: std::future::Future<Output = StorageResult<(sqlx::Transaction<'static, sqlx::Postgres>, T)>> + Send,
    {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(StorageError::from)?;
        match f(tx).await {
            Ok((tx, value)) => {
                tx.commit().await.map_err(StorageError::from)?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }
}

//! Key/value store abstraction: idempotency, rate windows, credential cache,
//! short-lived upload intents (§4.A).
//!
//! Production deployments point at Redis; tests and single-instance dev use
//! the in-process [`InMemoryKv`], which honours the same contract with a
//! concurrent map plus explicit expiry checks on read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::error::{StorageError, StorageResult};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<()>;
    async fn delete(&self, key: &str) -> StorageResult<()>;
    /// Atomically add `amount` to the counter at `key`, resetting its TTL,
    /// and return the new value. Used for rate buckets (§3 RateBucket).
    async fn increment_with_ttl(&self, key: &str, amount: i64, ttl: Duration) -> StorageResult<i64>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Concurrent-map KV store, grounded on the `DashMap`-based idempotency
/// registry pattern: entries carry their own expiry and are checked lazily
/// on access rather than swept by a background task.
#[derive(Clone, Default)]
pub struct InMemoryKv {
    entries: Arc<DashMap<String, Entry>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry: &Entry) -> bool {
        match entry.expires_at {
            Some(exp) => Instant::now() < exp,
            None => true,
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match self.entries.get(key) {
            Some(entry) if Self::is_live(&entry) => Ok(Some(entry.value.clone())),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn increment_with_ttl(&self, key: &str, amount: i64, ttl: Duration) -> StorageResult<i64> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: 0i64.to_le_bytes().to_vec(),
            expires_at: Some(Instant::now() + ttl),
        });

        if !Self::is_live(&entry) {
            entry.value = 0i64.to_le_bytes().to_vec();
        }
        entry.expires_at = Some(Instant::now() + ttl);

        let current = i64::from_le_bytes(entry.value.clone().try_into().map_err(|_| {
            StorageError::Permanent("corrupt counter encoding".to_string())
        })?);
        let next = current + amount;
        entry.value = next.to_le_bytes().to_vec();
        Ok(next)
    }
}

/// Redis-backed KV store for multi-instance deployments.
#[derive(Clone)]
pub struct RedisKv {
    manager: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StorageResult<()> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))
    }

    async fn increment_with_ttl(&self, key: &str, amount: i64, ttl: Duration) -> StorageResult<i64> {
        let mut conn = self.manager.clone();
        let (new_value,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCRBY").arg(key).arg(amount).ignore()
            .cmd("PEXPIRE").arg(key).arg(ttl.as_millis() as u64).ignore()
            .cmd("GET").arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        Ok(new_value)
    }
}

//! Queue Consumer (§4.G) — drains webhook/sync events fed by the inbound
//! webhook route through a bounded in-process channel. No external broker is
//! in scope (§1); the channel and worker pool live entirely in this process.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::storage::KvStore;

const CHANNEL_CAPACITY: usize = 1024;
const MAX_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub delivery_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send>>;
pub type EventHandler = Arc<dyn Fn(QueueMessage) -> HandlerFuture + Send + Sync>;

/// Handle retained by the HTTP layer to submit messages; the worker pool
/// itself runs detached in background tasks.
#[derive(Clone)]
pub struct QueueConsumer {
    sender: mpsc::Sender<QueueMessage>,
}

impl QueueConsumer {
    pub fn spawn(db: PgPool, kv: Arc<dyn KvStore>, handler: EventHandler, worker_count: usize, idempotency_ttl: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let receiver = Arc::new(Mutex::new(receiver));

        for worker_id in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let db = db.clone();
            let kv = kv.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let msg = {
                        let mut guard = receiver.lock().await;
                        guard.recv().await
                    };
                    let Some(msg) = msg else {
                        tracing::info!(worker_id, "queue: channel closed, worker exiting");
                        break;
                    };
                    process_message(worker_id, &db, kv.as_ref(), handler.as_ref(), msg, idempotency_ttl).await;
                }
            });
        }

        Self { sender }
    }

    /// Enqueue a message. Returns an error (rather than blocking the inbound
    /// request) when the channel is saturated — callers surface this as a
    /// retryable failure to the webhook sender.
    pub fn submit(&self, msg: QueueMessage) -> Result<(), BrokerError> {
        self.sender.try_send(msg).map_err(|_| {
            BrokerError::new(crate::error::ErrorKind::Server, "queue consumer saturated, retry later")
        })
    }
}

async fn process_message(
    worker_id: usize,
    db: &PgPool,
    kv: &dyn KvStore,
    handler: &(dyn Fn(QueueMessage) -> HandlerFuture + Send + Sync),
    msg: QueueMessage,
    idempotency_ttl: Duration,
) {
    let idemp_key = format!("idemp:{}", msg.delivery_id);
    match kv.get(&idemp_key).await {
        Ok(Some(_)) => {
            tracing::debug!(worker_id, delivery_id = %msg.delivery_id, "queue: duplicate delivery, acking without reprocessing");
            return;
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(worker_id, error = %e, "queue: idempotency lookup failed, proceeding without dedup");
        }
    }

    let mut attempts = 0u32;
    let mut last_error = None;

    while attempts < MAX_ATTEMPTS {
        attempts += 1;
        match handler(msg.clone()).await {
            Ok(()) => {
                if let Err(e) = kv.put(&idemp_key, b"done".to_vec(), Some(idempotency_ttl)).await {
                    tracing::warn!(worker_id, error = %e, delivery_id = %msg.delivery_id, "queue: failed to record idempotency marker");
                }
                return;
            }
            Err(e) => {
                let retryable = e.kind().is_retryable();
                tracing::warn!(worker_id, delivery_id = %msg.delivery_id, attempts, retryable, error = %e, "queue: handler failed");
                last_error = Some(e);
                if !retryable || attempts >= MAX_ATTEMPTS {
                    break;
                }
                let delay = crate::gateway::backoff_delay(attempts - 1, RETRY_BASE_DELAY, RETRY_MAX_DELAY);
                tokio::time::sleep(delay).await;
            }
        }
    }

    let last_error = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "exhausted retries".to_string());

    if let Err(e) = sqlx::query(
        "INSERT INTO dead_letter_entries (id, delivery_id, event_type, payload, last_error, attempts, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, now())",
    )
    .bind(Uuid::new_v4())
    .bind(&msg.delivery_id)
    .bind(&msg.event_type)
    .bind(&msg.payload)
    .bind(&last_error)
    .bind(attempts as i32)
    .execute(db)
    .await
    {
        tracing::error!(worker_id, delivery_id = %msg.delivery_id, error = %e, "queue: failed to persist dead-letter entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::InMemoryKv;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler_counting(counter: Arc<AtomicUsize>, fail_times: usize) -> EventHandler {
        Arc::new(move |_msg| {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < fail_times {
                    Err(BrokerError::new(crate::error::ErrorKind::Server, "transient failure"))
                } else {
                    Ok(())
                }
            })
        })
    }

    #[tokio::test]
    async fn duplicate_delivery_id_is_not_reprocessed() {
        let kv = Arc::new(InMemoryKv::new());
        kv.put("idemp:abc", b"done".to_vec(), Some(Duration::from_secs(60))).await.unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = handler_counting(counter.clone(), 0);

        process_message(0, &unconnected_pool(), kv.as_ref(), handler.as_ref(), QueueMessage {
            delivery_id: "abc".to_string(),
            event_type: "test".to_string(),
            payload: serde_json::json!({}),
        }, Duration::from_secs(60)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let kv = Arc::new(InMemoryKv::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = handler_counting(counter.clone(), 2);

        // No DB round trip on the success path, so a disconnected pool is fine here.
        process_message(0, &unconnected_pool(), kv.as_ref(), handler.as_ref(), QueueMessage {
            delivery_id: "retry-1".to_string(),
            event_type: "test".to_string(),
            payload: serde_json::json!({}),
        }, Duration::from_secs(60)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(kv.get("idemp:retry-1").await.unwrap().is_some());
    }

    fn unconnected_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/nonexistent")
            .expect("lazy pool construction never touches the network")
    }
}

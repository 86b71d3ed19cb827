//! Shared application state threaded through every handler via axum's
//! `State` extractor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::credentials::CredentialBroker;
use crate::gateway::OutboundGateway;
use crate::minting::MintingClient;
use crate::models::McpSession;
use crate::queue::QueueConsumer;
use crate::resolver::ContextResolver;
use crate::storage::kv::InMemoryKv;
use crate::storage::object::FsObjectStore;
use crate::storage::{KvStore, ObjectStore};

/// Central application state. Clone-friendly — every field is `Clone`
/// (`PgPool`, `Arc<...>`, `reqwest::Client`) so handlers receive a cheap copy.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub kv: Arc<dyn KvStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub http_client: reqwest::Client,
    pub gateway: Arc<OutboundGateway>,
    pub credentials: Arc<CredentialBroker>,
    pub resolver: Arc<ContextResolver>,
    /// MCP sessions (§3 MCPSession, §4.E) — process-local, never persisted.
    pub mcp_sessions: Arc<RwLock<HashMap<String, McpSession>>>,
    pub queue: Arc<QueueConsumer>,
    pub config: Config,
    /// `true` once startup (migrations + first reachability pass) settles;
    /// `/health` reports this verbatim (§4.F, §10.5).
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub async fn new(db: PgPool, config: Config) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.outbound_timeout)
            .build()?;

        let kv: Arc<dyn KvStore> = match &config.kv_url {
            Some(url) => Arc::new(crate::storage::kv::RedisKv::connect(url).await?),
            None => {
                tracing::warn!("state: no CHITTY_KV_URL configured, using in-process KV fallback");
                Arc::new(InMemoryKv::new())
            }
        };

        let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.object_store_root));

        let gateway = Arc::new(OutboundGateway::new(http_client.clone(), &config));
        let credentials = Arc::new(CredentialBroker::new(db.clone(), gateway.clone(), &config));
        let minting = MintingClient::new(
            http_client.clone(),
            config.minting_service_url.clone(),
            config.minting_service_token.clone(),
        );
        let resolver = Arc::new(ContextResolver::new(db.clone(), minting));

        let queue_handler = crate::webhook::event_handler(resolver.clone(), credentials.clone());
        let queue = Arc::new(QueueConsumer::spawn(
            db.clone(),
            kv.clone(),
            queue_handler,
            4,
            config.idempotency_ttl,
        ));

        Ok(Self {
            db,
            kv,
            objects,
            http_client,
            gateway,
            credentials,
            resolver,
            mcp_sessions: Arc::new(RwLock::new(HashMap::new())),
            queue,
            config,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Test-only constructor — uses `connect_lazy` so no real Postgres is
    /// needed; only suitable for handlers that don't issue SQL queries, or
    /// that surface DB errors gracefully.
    #[doc(hidden)]
    pub fn new_test() -> Self {
        let config = Config::for_test();
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("failed to build test HTTP client");
        let db = PgPool::connect_lazy(&config.database_url).expect("lazy pool construction never touches the network");

        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.object_store_root));
        let gateway = Arc::new(OutboundGateway::new(http_client.clone(), &config));
        let credentials = Arc::new(CredentialBroker::new(db.clone(), gateway.clone(), &config));
        let minting = MintingClient::new(
            http_client.clone(),
            config.minting_service_url.clone(),
            config.minting_service_token.clone(),
        );
        let resolver = Arc::new(ContextResolver::new(db.clone(), minting));
        let queue_handler = crate::webhook::event_handler(resolver.clone(), credentials.clone());
        let queue = Arc::new(QueueConsumer::spawn(db.clone(), kv.clone(), queue_handler, 1, config.idempotency_ttl));

        Self {
            db,
            kv,
            objects,
            http_client,
            gateway,
            credentials,
            resolver,
            mcp_sessions: Arc::new(RwLock::new(HashMap::new())),
            queue,
            config,
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        tracing::info!("state: marked ready");
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

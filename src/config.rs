//! Typed startup configuration.
//!
//! Loaded once in `main` from the process environment (via `dotenvy` in
//! local/dev). Missing required variables fail startup with a readable error
//! instead of surfacing later as a runtime `CONFIG_UNAVAILABLE`.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub kv_url: Option<String>,
    pub vault_addr: String,
    pub vault_token: String,
    pub minting_service_url: String,
    pub minting_service_token: String,
    pub object_store_root: String,
    pub log_format_json: bool,
    pub cors_allowed_origins: Vec<String>,
    pub encryption_key_material: Option<String>,

    pub breaker_failure_threshold: u32,
    pub breaker_failure_threshold_identity: u32,
    pub breaker_reset_timeout: Duration,
    pub breaker_reset_timeout_identity: Duration,

    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub outbound_timeout: Duration,

    pub credential_cache_ttl: Duration,
    pub credential_cache_max_entries: u64,

    pub mcp_idle_ttl: Duration,
    pub mcp_session_cap: usize,

    pub idempotency_ttl: Duration,

    /// Per-identity request budget per minute window (§4.B, §8 P9), enforced
    /// by [`crate::rate_limit::check_and_count`] in front of every
    /// authenticated route.
    pub rate_limit_per_minute: i64,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let database_url = require_env("DATABASE_URL")?;
        let vault_addr = require_env("CHITTY_VAULT_ADDR")?;
        let vault_token = require_env("CHITTY_VAULT_TOKEN")?;
        let minting_service_url = require_env("CHITTY_MINTING_URL")?;
        let minting_service_token = require_env("CHITTY_MINTING_TOKEN")?;

        Ok(Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url,
            kv_url: std::env::var("CHITTY_KV_URL").ok(),
            vault_addr,
            vault_token,
            minting_service_url,
            minting_service_token,
            object_store_root: std::env::var("CHITTY_OBJECT_STORE_ROOT")
                .unwrap_or_else(|_| "./data/objects".to_string()),
            log_format_json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            cors_allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            encryption_key_material: std::env::var("CHITTY_ENCRYPTION_KEY").ok(),

            breaker_failure_threshold: env_u32("BREAKER_FAILURE_THRESHOLD", 5),
            breaker_failure_threshold_identity: env_u32("BREAKER_FAILURE_THRESHOLD_IDENTITY", 3),
            breaker_reset_timeout: Duration::from_secs(env_u64("BREAKER_RESET_TIMEOUT_SECS", 60)),
            breaker_reset_timeout_identity: Duration::from_secs(env_u64(
                "BREAKER_RESET_TIMEOUT_IDENTITY_SECS",
                30,
            )),

            retry_max_attempts: env_u32("RETRY_MAX_ATTEMPTS", 3),
            retry_base_delay: Duration::from_millis(env_u64("RETRY_BASE_DELAY_MS", 1000)),
            retry_max_delay: Duration::from_millis(env_u64("RETRY_MAX_DELAY_MS", 30_000)),
            outbound_timeout: Duration::from_secs(env_u64("OUTBOUND_TIMEOUT_SECS", 10)),

            credential_cache_ttl: Duration::from_secs(env_u64("CREDENTIAL_CACHE_TTL_SECS", 300)),
            credential_cache_max_entries: env_u64("CREDENTIAL_CACHE_MAX_ENTRIES", 256),

            mcp_idle_ttl: Duration::from_secs(env_u64("MCP_IDLE_TTL_SECS", 300)),
            mcp_session_cap: env_u64("MCP_SESSION_CAP", 100) as usize,

            idempotency_ttl: Duration::from_secs(env_u64("IDEMPOTENCY_TTL_SECS", 86_400)),

            rate_limit_per_minute: env_u64("RATE_LIMIT_PER_MINUTE", 120) as i64,
        })
    }

    /// A config suitable for tests: no required env vars, all externals
    /// pointed at obviously-unreachable placeholders so failures are explicit
    /// rather than silently hitting something real.
    pub fn for_test() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            database_url: "postgres://localhost/nonexistent".to_string(),
            kv_url: None,
            vault_addr: "http://127.0.0.1:1".to_string(),
            vault_token: "test-token".to_string(),
            minting_service_url: "http://127.0.0.1:1".to_string(),
            minting_service_token: "test-token".to_string(),
            object_store_root: "./target/test-objects".to_string(),
            log_format_json: false,
            cors_allowed_origins: vec![],
            encryption_key_material: Some("test-encryption-key-material".to_string()),
            breaker_failure_threshold: 5,
            breaker_failure_threshold_identity: 3,
            breaker_reset_timeout: Duration::from_secs(60),
            breaker_reset_timeout_identity: Duration::from_secs(30),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(1000),
            retry_max_delay: Duration::from_millis(30_000),
            outbound_timeout: Duration::from_secs(10),
            credential_cache_ttl: Duration::from_secs(300),
            credential_cache_max_entries: 256,
            mcp_idle_ttl: Duration::from_secs(300),
            mcp_session_cap: 100,
            idempotency_ttl: Duration::from_secs(86_400),
            rate_limit_per_minute: 120,
        }
    }
}

fn require_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing required environment variable {key}"))
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

//! API key authentication middleware (§6). Keys live in KV under
//! `key:{apiKey}` as an [`ApiKeyRecord`]; this middleware never touches
//! Postgres so an auth check costs exactly one KV round trip.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::BrokerError;
use crate::models::{ApiKeyRecord, ApiKeyStatus};
use crate::state::AppState;

const API_KEY_HEADER: &str = "x-chittyos-api-key";

fn extract_api_key(request: &Request) -> Option<String> {
    if let Some(key) = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return Some(key.to_string());
    }
    request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Enforces an API key on every request it wraps. Applied selectively in
/// [`crate::create_router`] — discovery routes (`/health`, `/openapi.json`,
/// `/.well-known/chitty.json`) are mounted outside this layer.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, BrokerError> {
    let Some(api_key) = extract_api_key(&request) else {
        return Err(BrokerError::new(
            crate::error::ErrorKind::Auth,
            "missing API key: supply X-ChittyOS-API-Key or Authorization: Bearer",
        ));
    };

    let kv_key = format!("key:{api_key}");
    let record = state
        .kv
        .get(&kv_key)
        .await
        .map_err(BrokerError::from)?
        .ok_or_else(|| BrokerError::new(crate::error::ErrorKind::Auth, "unknown API key"))?;

    let record: ApiKeyRecord = serde_json::from_slice(&record)
        .map_err(|e| BrokerError::new(crate::error::ErrorKind::Server, format!("corrupt API key record: {e}")))?;

    if record.status != ApiKeyStatus::Active {
        return Err(BrokerError::new(crate::error::ErrorKind::Permission, "API key is not active"));
    }

    // KV-backed token bucket (§4.B, §8 P9) — the cross-instance source of
    // truth for admission control; the per-process `GovernorLayer` tiers in
    // `create_router` only catch bursts within a single instance.
    let admitted = crate::rate_limit::check_and_count(
        state.kv.as_ref(),
        "discover",
        &api_key,
        state.config.rate_limit_per_minute,
    )
    .await;
    if !admitted {
        return Err(BrokerError::new(crate::error::ErrorKind::RateLimit, "rate limit exceeded"));
    }

    Ok(next.run(request).await)
}

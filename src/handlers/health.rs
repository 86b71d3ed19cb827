//! Liveness, readiness, and service-discovery metadata (§4.F, §10.5).

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /health` — process liveness. Never touches the database; a
/// process that can answer this is alive even if storage is unreachable.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Process is alive"))
)]
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "alive",
        "service": "chitty-context-broker",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /health/ready` — readiness. Reports on the storage adapter and
/// the KV layer so load balancers can pull the instance before either is
/// reachable.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Service is ready"),
        (status = 503, description = "A dependency is unreachable")
    )
)]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db_ok = sqlx::query("SELECT 1").fetch_one(&state.db).await.is_ok();
    let kv_ok = state.kv.get("readiness-probe").await.is_ok();

    let ready = state.is_ready() && db_ok && kv_ok;
    let body = json!({
        "ready": ready,
        "checks": {
            "database": db_ok,
            "kv": kv_ok,
        },
    });

    if ready {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// `GET /.well-known/chitty.json` — service discovery document advertising
/// the composite API and MCP transport to consumers that bootstrap by URL.
pub async fn service_discovery() -> Json<Value> {
    Json(json!({
        "service": "chitty-context-broker",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "api": "/api/v1",
            "mcp": "/mcp",
            "openapi": "/openapi.json",
        },
    }))
}

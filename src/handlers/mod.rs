//! Handler modules for the Composite API Surface (§4.F).
//!
//! - `health` — liveness/readiness, OpenAPI, service-discovery metadata
//! - `context` — resolver API (`resolve|bind|unbind|switch|expand|current|search|summary`)
//! - `credentials` — broker API (`provision|validate|revoke|audit|retrieve`)
//! - `sessions` — durable session CRUD
//! - `documents` — document CRUD delegated to the object store
//! - `proxy` — `/api/{service}/*` resilient wrappers over the outbound gateway
//! - `webhook` — inbound webhook intake, handed off to the queue consumer
//! - `batch` — `/api/v1/batch` composite sub-request runner

pub mod batch;
pub mod context;
pub mod credentials;
pub mod documents;
pub mod health;
pub mod proxy;
pub mod sessions;
pub mod webhook;

use serde::Serialize;
use serde_json::json;

/// Wraps a successful payload in the canonical envelope (§4.F, §7).
pub fn ok_envelope<T: Serialize>(data: T) -> serde_json::Value {
    json!({
        "success": true,
        "data": data,
        "_meta": {
            "requestId": uuid::Uuid::new_v4().to_string(),
            "timestamp": chrono::Utc::now().timestamp(),
            "service": "chitty-context-broker",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

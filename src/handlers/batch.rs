//! Composite batch endpoint (§4.F) — runs up to 10 named sub-operations
//! against the Context Resolver and Credential Broker in one round trip,
//! either sequentially (threading the previous sub-response's `context`
//! forward) or concurrently, and returns 207 Multi-Status when any
//! sub-operation failed.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{BrokerError, ErrorKind};
use crate::models::{AnchorHints, DecommissionAction, PendingContext, SessionMetrics};
use crate::state::AppState;

const MAX_BATCH_SIZE: usize = 10;

#[derive(Debug, Deserialize)]
pub struct BatchSubRequest {
    /// Dotted operation name, e.g. `"context.resolve"`, `"credentials.provision"`.
    pub op: String,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub requests: Vec<BatchSubRequest>,
    /// Run independently rather than threading context forward. Defaults to
    /// sequential, matching the spec's "sequentially ... or in parallel".
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Serialize)]
struct BatchOperationResult {
    op: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

fn error_to_value(err: &BrokerError) -> Value {
    match err {
        BrokerError::Kind { kind, message, details, breaker_open } => {
            let mut v = json!({ "code": kind, "message": message });
            if let Some(d) = details {
                v["details"] = d.clone();
            }
            if *breaker_open {
                v["breakerOpen"] = json!(true);
            }
            v
        }
        BrokerError::Internal(_) => json!({ "code": ErrorKind::Unknown, "message": "internal error" }),
    }
}

/// Threads the previous sub-response's `context` object (if present, with an
/// `id`) into the next sub-request body as `context_id`, unless the caller
/// already supplied one.
fn thread_context(body: &mut Value, previous: Option<&Value>) {
    let Some(prev) = previous else { return };
    let Some(context) = prev.get("context").or(Some(prev)) else { return };
    let Some(id) = context.get("id").and_then(|v| v.as_str()) else { return };
    if let Value::Object(map) = body {
        if !map.contains_key("context_id") && !map.contains_key("contextId") {
            map.insert("context_id".to_string(), json!(id));
        }
    }
}

async fn dispatch(state: &AppState, op: &str, body: Value) -> Result<Value, BrokerError> {
    match op {
        "context.resolve" => {
            let hints: AnchorHints = serde_json::from_value(body)
                .map_err(|e| BrokerError::validation(format!("invalid context.resolve body: {e}")))?;
            let result = state.resolver.resolve(&hints).await?;
            Ok(serde_json::to_value(result).map_err(anyhow::Error::from)?)
        }
        "context.create" => {
            let pending: PendingContext = serde_json::from_value(body)
                .map_err(|e| BrokerError::validation(format!("invalid context.create body: {e}")))?;
            let context = state.resolver.create_context(&pending).await?;
            Ok(serde_json::to_value(context).map_err(anyhow::Error::from)?)
        }
        "context.bind" => {
            #[derive(Deserialize)]
            struct Req {
                context_id: Uuid,
                session_id: String,
                platform: Option<String>,
            }
            let req: Req = serde_json::from_value(body)
                .map_err(|e| BrokerError::validation(format!("invalid context.bind body: {e}")))?;
            let binding = state
                .resolver
                .bind_session(req.context_id, &req.session_id, req.platform.as_deref())
                .await?;
            Ok(serde_json::to_value(binding).map_err(anyhow::Error::from)?)
        }
        "context.unbind" => {
            #[derive(Deserialize)]
            struct Req {
                session_id: String,
                metrics: SessionMetrics,
            }
            let req: Req = serde_json::from_value(body)
                .map_err(|e| BrokerError::validation(format!("invalid context.unbind body: {e}")))?;
            let rollup = state
                .resolver
                .unbind_session(&req.session_id, &req.metrics, crate::models::UnbindReason::SessionComplete)
                .await?;
            Ok(serde_json::to_value(rollup).map_err(anyhow::Error::from)?)
        }
        "context.switch" => {
            #[derive(Deserialize)]
            struct Req {
                session_id: String,
                to_chitty_id: String,
                metrics: SessionMetrics,
            }
            let req: Req = serde_json::from_value(body)
                .map_err(|e| BrokerError::validation(format!("invalid context.switch body: {e}")))?;
            let binding = state
                .resolver
                .switch_context(&req.session_id, &req.to_chitty_id, &req.metrics)
                .await?;
            Ok(serde_json::to_value(binding).map_err(anyhow::Error::from)?)
        }
        "context.get" => {
            #[derive(Deserialize)]
            struct Req {
                context_id: Uuid,
            }
            let req: Req = serde_json::from_value(body)
                .map_err(|e| BrokerError::validation(format!("invalid context.get body: {e}")))?;
            let context = state
                .resolver
                .find_by_id(req.context_id)
                .await?
                .ok_or_else(|| BrokerError::not_found(format!("context '{}' not found", req.context_id)))?;
            Ok(serde_json::to_value(context).map_err(anyhow::Error::from)?)
        }
        "context.decommission" => {
            #[derive(Deserialize)]
            struct Req {
                context_id: Uuid,
                action: String,
                #[serde(default)]
                force: bool,
            }
            let req: Req = serde_json::from_value(body)
                .map_err(|e| BrokerError::validation(format!("invalid context.decommission body: {e}")))?;
            let action = match req.action.as_str() {
                "archive" => DecommissionAction::Archive,
                "revoke" => DecommissionAction::Revoke,
                other => return Err(BrokerError::validation(format!("unknown decommission action '{other}'"))),
            };
            let context = state.resolver.decommission(req.context_id, action, req.force).await?;
            Ok(serde_json::to_value(context).map_err(anyhow::Error::from)?)
        }
        "credentials.provision" => {
            #[derive(Deserialize)]
            struct Req {
                #[serde(rename = "type")]
                kind: String,
                context_id: Uuid,
                requesting_service: String,
                #[serde(default = "default_ttl_hours")]
                ttl_hours: i64,
            }
            let req: Req = serde_json::from_value(body)
                .map_err(|e| BrokerError::validation(format!("invalid credentials.provision body: {e}")))?;
            let (token_id, secret, expires_at) = state
                .credentials
                .provision(&req.kind, req.context_id, &req.requesting_service, req.ttl_hours)
                .await?;
            Ok(json!({ "tokenId": token_id, "secret": secret, "expiresAt": expires_at }))
        }
        "credentials.validate" => {
            #[derive(Deserialize)]
            struct Req {
                token_id: String,
            }
            let req: Req = serde_json::from_value(body)
                .map_err(|e| BrokerError::validation(format!("invalid credentials.validate body: {e}")))?;
            let status = state.credentials.validate(&req.token_id).await?;
            Ok(json!({ "tokenId": req.token_id, "status": status }))
        }
        other => Err(BrokerError::validation(format!("unknown batch operation '{other}'"))),
    }
}

fn default_ttl_hours() -> i64 {
    24
}

/// `POST /api/v1/batch`
pub async fn run(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<(StatusCode, Json<Value>), BrokerError> {
    if req.requests.is_empty() {
        return Err(BrokerError::validation("batch request must contain at least one sub-request"));
    }
    if req.requests.len() > MAX_BATCH_SIZE {
        return Err(BrokerError::validation(format!(
            "batch request exceeds the maximum of {MAX_BATCH_SIZE} sub-requests"
        )));
    }

    let mut results = Vec::with_capacity(req.requests.len());
    let mut any_failed = false;

    if req.parallel {
        let futures = req.requests.into_iter().map(|sub| async {
            let op = sub.op.clone();
            match dispatch(&state, &op, sub.body).await {
                Ok(data) => BatchOperationResult { op, success: true, data: Some(data), error: None },
                Err(err) => BatchOperationResult { op, success: false, data: None, error: Some(error_to_value(&err)) },
            }
        });
        results = futures_util::future::join_all(futures).await;
        any_failed = results.iter().any(|r| !r.success);
    } else {
        let mut previous: Option<Value> = None;
        for mut sub in req.requests {
            thread_context(&mut sub.body, previous.as_ref());
            let op = sub.op.clone();
            match dispatch(&state, &op, sub.body).await {
                Ok(data) => {
                    previous = Some(data.clone());
                    results.push(BatchOperationResult { op, success: true, data: Some(data), error: None });
                }
                Err(err) => {
                    any_failed = true;
                    results.push(BatchOperationResult { op, success: false, data: None, error: Some(error_to_value(&err)) });
                    // Best-effort: remaining sub-requests still run against
                    // whatever context was established so far (§4.F: composites
                    // are at-least-once, not strictly transactional).
                }
            }
        }
    }

    let status = if any_failed { StatusCode::MULTI_STATUS } else { StatusCode::OK };
    let all_succeeded = !any_failed;
    Ok((
        status,
        Json(json!({
            "success": all_succeeded,
            "data": { "operations": results },
            "_meta": {
                "requestId": Uuid::new_v4().to_string(),
                "timestamp": chrono::Utc::now().timestamp(),
                "service": "chitty-context-broker",
                "version": env!("CARGO_PKG_VERSION"),
            }
        })),
    ))
}

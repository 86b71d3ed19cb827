//! Context Resolver API (§4.D, §4.F) — thin HTTP adapters over
//! [`crate::resolver::ContextResolver`]. All business logic lives there;
//! handlers here only parse requests and wrap responses in the envelope.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::models::{AnchorHints, DecommissionAction, PendingContext, SessionMetrics, UnbindReason};
use crate::state::AppState;

use super::ok_envelope;

/// `POST /api/v1/context/resolve`
pub async fn resolve(
    State(state): State<AppState>,
    Json(hints): Json<AnchorHints>,
) -> Result<Json<Value>, BrokerError> {
    let result = state.resolver.resolve(&hints).await?;
    Ok(Json(ok_envelope(result)))
}

/// `POST /api/v1/context/create` — confirms a `CreateNew` resolution by
/// persisting the pending context it returned.
pub async fn create(
    State(state): State<AppState>,
    Json(pending): Json<PendingContext>,
) -> Result<Json<Value>, BrokerError> {
    let context = state.resolver.create_context(&pending).await?;
    Ok(Json(ok_envelope(context)))
}

#[derive(Debug, Deserialize)]
pub struct BindRequest {
    pub context_id: Uuid,
    pub session_id: String,
    pub platform: Option<String>,
}

/// `POST /api/v1/context/bind`
pub async fn bind(
    State(state): State<AppState>,
    Json(req): Json<BindRequest>,
) -> Result<Json<Value>, BrokerError> {
    let binding = state
        .resolver
        .bind_session(req.context_id, &req.session_id, req.platform.as_deref())
        .await?;
    Ok(Json(ok_envelope(binding)))
}

#[derive(Debug, Deserialize)]
pub struct UnbindRequest {
    pub session_id: String,
    pub metrics: SessionMetrics,
    #[serde(default)]
    pub reason: Option<String>,
}

fn parse_unbind_reason(value: Option<&str>) -> UnbindReason {
    match value {
        Some("timeout") => UnbindReason::Timeout,
        Some("error") => UnbindReason::Error,
        Some("revoked") => UnbindReason::Revoked,
        _ => UnbindReason::SessionComplete,
    }
}

/// `POST /api/v1/context/unbind`
pub async fn unbind(
    State(state): State<AppState>,
    Json(req): Json<UnbindRequest>,
) -> Result<Json<Value>, BrokerError> {
    let reason = parse_unbind_reason(req.reason.as_deref());
    let rollup = state.resolver.unbind_session(&req.session_id, &req.metrics, reason).await?;
    Ok(Json(ok_envelope(rollup)))
}

#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    pub session_id: String,
    pub to_chitty_id: String,
    pub metrics: SessionMetrics,
}

/// `POST /api/v1/context/switch`
pub async fn switch(
    State(state): State<AppState>,
    Json(req): Json<SwitchRequest>,
) -> Result<Json<Value>, BrokerError> {
    let binding = state
        .resolver
        .switch_context(&req.session_id, &req.to_chitty_id, &req.metrics)
        .await?;
    Ok(Json(ok_envelope(binding)))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub support_type: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

/// `GET /api/v1/context/search`
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>, BrokerError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 200);
    let contexts = state
        .resolver
        .search(params.support_type.as_deref(), params.status.as_deref(), limit)
        .await?;
    Ok(Json(ok_envelope(contexts)))
}

/// `GET /api/v1/context/{id}` — also serves as "expand" (§4.D `expand`): the
/// full context row, since `ContextEntity` already carries its anchors.
pub async fn get_context(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, BrokerError> {
    let context = state
        .resolver
        .find_by_id(id)
        .await?
        .ok_or_else(|| BrokerError::not_found(format!("context '{id}' not found")))?;
    Ok(Json(ok_envelope(context)))
}

/// `GET /api/v1/context/{id}/decommission/preview`
pub async fn decommission_preview(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, BrokerError> {
    let preview = state.resolver.preview_decommission(id).await?;
    Ok(Json(ok_envelope(preview)))
}

#[derive(Debug, Deserialize)]
pub struct DecommissionRequest {
    pub action: String,
    #[serde(default)]
    pub force: bool,
}

/// `POST /api/v1/context/{id}/decommission`
pub async fn decommission(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<DecommissionRequest>,
) -> Result<Json<Value>, BrokerError> {
    let action = match req.action.as_str() {
        "archive" => DecommissionAction::Archive,
        "revoke" => DecommissionAction::Revoke,
        other => return Err(BrokerError::validation(format!("unknown decommission action '{other}'"))),
    };
    let context = state.resolver.decommission(id, action, req.force).await?;
    Ok(Json(ok_envelope(context)))
}

#[derive(Debug, Deserialize)]
pub struct SupernovaRequest {
    pub source_ids: Vec<Uuid>,
}

/// `POST /api/v1/context/lifecycle/supernova`
pub async fn supernova(
    State(state): State<AppState>,
    Json(req): Json<SupernovaRequest>,
) -> Result<Json<Value>, BrokerError> {
    let context = state.resolver.supernova(&req.source_ids).await?;
    Ok(Json(ok_envelope(context)))
}

#[derive(Debug, Deserialize)]
pub struct FissionRequest {
    pub source_id: Uuid,
    pub count: u32,
}

/// `POST /api/v1/context/lifecycle/fission`
pub async fn fission(
    State(state): State<AppState>,
    Json(req): Json<FissionRequest>,
) -> Result<Json<Value>, BrokerError> {
    let children = state.resolver.fission(req.source_id, req.count).await?;
    Ok(Json(ok_envelope(children)))
}

#[derive(Debug, Deserialize)]
pub struct DerivativeRequest {
    pub source_id: Uuid,
}

/// `POST /api/v1/context/lifecycle/derivative`
pub async fn derivative(
    State(state): State<AppState>,
    Json(req): Json<DerivativeRequest>,
) -> Result<Json<Value>, BrokerError> {
    let context = state.resolver.derivative(req.source_id).await?;
    Ok(Json(ok_envelope(context)))
}

#[derive(Debug, Deserialize)]
pub struct SuspensionRequest {
    pub source_id: Uuid,
    pub reason: String,
}

/// `POST /api/v1/context/lifecycle/suspension`
pub async fn suspension(
    State(state): State<AppState>,
    Json(req): Json<SuspensionRequest>,
) -> Result<Json<Value>, BrokerError> {
    let context = state.resolver.suspension(req.source_id, &req.reason).await?;
    Ok(Json(ok_envelope(context)))
}

/// `GET /api/v1/context/current/{sessionId}` — the context currently bound
/// to a session, if any.
pub async fn current(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, BrokerError> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT context_id FROM context_session_bindings WHERE session_id = $1 AND unbound_at IS NULL",
    )
    .bind(&session_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    match row {
        None => Ok(Json(ok_envelope(json!({ "sessionId": session_id, "bound": false })))),
        Some((context_id,)) => {
            let context = state
                .resolver
                .find_by_id(context_id)
                .await?
                .ok_or_else(|| BrokerError::not_found(format!("context '{context_id}' not found")))?;
            Ok(Json(ok_envelope(context)))
        }
    }
}

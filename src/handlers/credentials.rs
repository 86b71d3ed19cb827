//! Credential Broker API (§4.C, §4.F) — thin HTTP adapters over
//! [`crate::credentials::CredentialBroker`].

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::state::AppState;

use super::ok_envelope;

#[derive(Debug, Deserialize)]
pub struct RetrieveParams {
    pub service: String,
}

/// `GET /api/v1/credentials/retrieve?service=...`
pub async fn retrieve(
    State(state): State<AppState>,
    Query(params): Query<RetrieveParams>,
) -> Result<Json<Value>, BrokerError> {
    let token = state.credentials.get_service_token(&params.service).await?;
    Ok(Json(ok_envelope(json!({ "service": params.service, "token": token }))))
}

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub context_id: Uuid,
    pub requesting_service: String,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
}

fn default_ttl_hours() -> i64 {
    24
}

/// `POST /api/v1/credentials/provision`
pub async fn provision(
    State(state): State<AppState>,
    Json(req): Json<ProvisionRequest>,
) -> Result<Json<Value>, BrokerError> {
    let (token_id, secret, expires_at) = state
        .credentials
        .provision(&req.kind, req.context_id, &req.requesting_service, req.ttl_hours)
        .await?;
    Ok(Json(ok_envelope(json!({
        "tokenId": token_id,
        "secret": secret,
        "expiresAt": expires_at,
    }))))
}

#[derive(Debug, Deserialize)]
pub struct ValidateParams {
    pub token_id: String,
}

/// `GET /api/v1/credentials/validate?tokenId=...`
pub async fn validate(
    State(state): State<AppState>,
    Query(params): Query<ValidateParams>,
) -> Result<Json<Value>, BrokerError> {
    let status = state.credentials.validate(&params.token_id).await?;
    Ok(Json(ok_envelope(json!({ "tokenId": params.token_id, "status": status }))))
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub token_id: String,
    #[serde(default)]
    pub reason: String,
}

/// `POST /api/v1/credentials/revoke`
pub async fn revoke(
    State(state): State<AppState>,
    Json(req): Json<RevokeRequest>,
) -> Result<Json<Value>, BrokerError> {
    state.credentials.revoke(&req.token_id, &req.reason).await?;
    Ok(Json(ok_envelope(json!({ "tokenId": req.token_id, "revoked": true }))))
}

#[derive(Debug, Deserialize)]
pub struct AuditParams {
    pub service: Option<String>,
    pub limit: Option<i64>,
}

/// `GET /api/v1/credentials/audit`
pub async fn audit(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> Result<Json<Value>, BrokerError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let entries = state.credentials.audit(params.service.as_deref(), limit).await?;
    Ok(Json(ok_envelope(entries)))
}

/// `GET /api/v1/credentials/audit/{tokenId}` — convenience path form, same
/// data narrowed by caller-supplied `tokenId` rather than `service`.
pub async fn audit_for_token(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> Result<Json<Value>, BrokerError> {
    let status = state.credentials.validate(&token_id).await?;
    Ok(Json(ok_envelope(json!({ "tokenId": token_id, "status": status }))))
}

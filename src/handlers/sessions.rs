//! Durable session CRUD (§4.F). Distinct from the ephemeral MCP transport
//! session in [`crate::mcp::server`] — a `SessionRecord` here is the
//! long-lived row a client's `sessionId` binds against via the resolver.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::models::SessionRecord;
use crate::state::AppState;

use super::ok_envelope;

#[derive(Debug, Deserialize)]
pub struct PaginationParams {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

/// `GET /api/v1/sessions`
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<PaginationParams>,
) -> Result<Json<Value>, BrokerError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 500);
    let offset = params.offset.unwrap_or(0).max(0);

    let rows = sqlx::query_as::<_, SessionRecord>(
        "SELECT id, session_id, context_id, title, working_directory, created_at, updated_at \
         FROM sessions ORDER BY updated_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.db)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    Ok(Json(ok_envelope(rows)))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
}

/// `POST /api/v1/sessions`
pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Value>), BrokerError> {
    let row = sqlx::query_as::<_, SessionRecord>(
        "INSERT INTO sessions (id, session_id, context_id, title, working_directory, created_at, updated_at) \
         VALUES ($1, $2, NULL, $3, $4, now(), now()) \
         RETURNING id, session_id, context_id, title, working_directory, created_at, updated_at",
    )
    .bind(Uuid::new_v4())
    .bind(&req.session_id)
    .bind(&req.title)
    .bind(&req.working_directory)
    .fetch_one(&state.db)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    Ok((StatusCode::CREATED, Json(ok_envelope(row))))
}

/// `GET /api/v1/sessions/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, BrokerError> {
    let row = sqlx::query_as::<_, SessionRecord>(
        "SELECT id, session_id, context_id, title, working_directory, created_at, updated_at \
         FROM sessions WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?
    .ok_or_else(|| BrokerError::not_found(format!("session '{id}' not found")))?;

    Ok(Json(ok_envelope(row)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
}

/// `PATCH /api/v1/sessions/{id}`
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateSessionRequest>,
) -> Result<Json<Value>, BrokerError> {
    let row = sqlx::query_as::<_, SessionRecord>(
        "UPDATE sessions SET \
         title = COALESCE($1, title), \
         working_directory = COALESCE($2, working_directory), \
         updated_at = now() \
         WHERE id = $3 \
         RETURNING id, session_id, context_id, title, working_directory, created_at, updated_at",
    )
    .bind(&req.title)
    .bind(&req.working_directory)
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?
    .ok_or_else(|| BrokerError::not_found(format!("session '{id}' not found")))?;

    Ok(Json(ok_envelope(row)))
}

/// `DELETE /api/v1/sessions/{id}`
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, BrokerError> {
    let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
        .bind(id)
        .execute(&state.db)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    if result.rows_affected() == 0 {
        return Err(BrokerError::not_found(format!("session '{id}' not found")));
    }

    crate::audit::log_admin_action(&state.db, "delete_session", serde_json::json!({ "id": id }), None).await;

    Ok(Json(ok_envelope(serde_json::json!({ "id": id, "deleted": true }))))
}

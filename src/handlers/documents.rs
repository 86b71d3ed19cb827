//! Document CRUD (§4.A, §4.F) — metadata lives in Postgres, bytes live in
//! the object store at `/chittyid/{contextId}/{docType}/{docId}`.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BrokerError, ErrorKind};
use crate::models::DocumentRecord;
use crate::state::AppState;

use super::ok_envelope;

fn object_key(context_id: Uuid, doc_type: &str, doc_id: Uuid) -> String {
    format!("/chittyid/{context_id}/{doc_type}/{doc_id}")
}

/// `POST /api/v1/contexts/{contextId}/documents/{docType}` — body is the raw
/// document bytes; `content-type` becomes the stored mime.
pub async fn upload(
    State(state): State<AppState>,
    Path((context_id, doc_type)): Path<(Uuid, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, BrokerError> {
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let doc_id = Uuid::new_v4();
    let key = object_key(context_id, &doc_type, doc_id);
    let size_bytes = body.len() as i64;

    state.objects.put(&key, body.to_vec(), &mime).await.map_err(BrokerError::from)?;

    let record = sqlx::query_as::<_, DocumentRecord>(
        "INSERT INTO documents (id, context_id, doc_type, mime, object_key, size_bytes, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, now()) \
         RETURNING id, context_id, doc_type, mime, object_key, size_bytes, created_at",
    )
    .bind(doc_id)
    .bind(context_id)
    .bind(&doc_type)
    .bind(&mime)
    .bind(&key)
    .bind(size_bytes)
    .fetch_one(&state.db)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    Ok(Json(ok_envelope(record)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub doc_type: Option<String>,
}

/// `GET /api/v1/contexts/{contextId}/documents`
pub async fn list(
    State(state): State<AppState>,
    Path(context_id): Path<Uuid>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, BrokerError> {
    let rows = sqlx::query_as::<_, DocumentRecord>(
        "SELECT id, context_id, doc_type, mime, object_key, size_bytes, created_at FROM documents \
         WHERE context_id = $1 AND ($2::text IS NULL OR doc_type = $2) ORDER BY created_at DESC",
    )
    .bind(context_id)
    .bind(params.doc_type)
    .fetch_all(&state.db)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    Ok(Json(ok_envelope(rows)))
}

/// `GET /api/v1/documents/{id}` — metadata only.
pub async fn get_metadata(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, BrokerError> {
    let record = sqlx::query_as::<_, DocumentRecord>(
        "SELECT id, context_id, doc_type, mime, object_key, size_bytes, created_at FROM documents WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?
    .ok_or_else(|| BrokerError::not_found(format!("document '{id}' not found")))?;

    Ok(Json(ok_envelope(record)))
}

/// `GET /api/v1/documents/{id}/content` — raw bytes.
pub async fn get_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, BrokerError> {
    let record = sqlx::query_as::<_, DocumentRecord>(
        "SELECT id, context_id, doc_type, mime, object_key, size_bytes, created_at FROM documents WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?
    .ok_or_else(|| BrokerError::not_found(format!("document '{id}' not found")))?;

    let (bytes, mime) = state
        .objects
        .get(&record.object_key)
        .await
        .map_err(BrokerError::from)?
        .ok_or_else(|| BrokerError::new(ErrorKind::NotFound, "document metadata exists but bytes are missing from the object store"))?;

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, mime)], bytes))
}

/// `DELETE /api/v1/documents/{id}`
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, BrokerError> {
    let record = sqlx::query_as::<_, DocumentRecord>(
        "SELECT id, context_id, doc_type, mime, object_key, size_bytes, created_at FROM documents WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?
    .ok_or_else(|| BrokerError::not_found(format!("document '{id}' not found")))?;

    state.objects.delete(&record.object_key).await.map_err(BrokerError::from)?;

    sqlx::query("DELETE FROM documents WHERE id = $1")
        .bind(id)
        .execute(&state.db)
        .await
        .map_err(|e| BrokerError::from(crate::storage::error::StorageError::from(e)))?;

    Ok(Json(ok_envelope(serde_json::json!({ "id": id, "deleted": true }))))
}

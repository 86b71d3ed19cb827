//! MCP Streamable HTTP transport (§4.E) — `POST /mcp` for JSON-RPC calls,
//! `GET /mcp` for the SSE stream, `DELETE /mcp` to terminate a session.
//! Session identity is carried in the `mcp-session-id` header.

use std::convert::Infallible;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream;
use serde_json::{json, Value};

use crate::mcp::tools;
use crate::models::McpSession;
use crate::state::AppState;

const MCP_PROTOCOL_VERSION: &str = "2025-03-26";
const MCP_SERVER_NAME: &str = "chitty-context-broker";
const SESSION_HEADER: &str = "mcp-session-id";

fn session_id_header(headers: &HeaderMap) -> Option<String> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

/// Lazy idle eviction + LRU hard cap, driven off the request path (§9) — no
/// background sweep task. Called once per request before dispatch.
async fn sweep_sessions(state: &AppState) {
    let mut sessions = state.mcp_sessions.write().await;
    let idle_ttl = state.config.mcp_idle_ttl;
    sessions.retain(|_, session| session.last_access.elapsed() < idle_ttl);

    if sessions.len() > state.config.mcp_session_cap {
        let mut by_access: Vec<(String, Instant)> =
            sessions.iter().map(|(id, s)| (id.clone(), s.last_access)).collect();
        by_access.sort_by_key(|(_, last_access)| *last_access);
        let overflow = sessions.len() - state.config.mcp_session_cap;
        for (id, _) in by_access.into_iter().take(overflow) {
            sessions.remove(&id);
        }
    }
}

pub async fn mcp_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    sweep_sessions(&state).await;

    let method = request.get("method").and_then(|v| v.as_str()).unwrap_or("");
    let id = request.get("id").cloned();
    let params = request.get("params").cloned().unwrap_or(json!({}));
    let incoming_session_id = session_id_header(&headers);

    if method != "initialize" {
        if let Some(sid) = &incoming_session_id {
            let mut sessions = state.mcp_sessions.write().await;
            match sessions.get_mut(sid) {
                Some(session) => session.last_access = Instant::now(),
                None => {
                    return (
                        StatusCode::NOT_FOUND,
                        Json(json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {"code": -32001, "message": "unknown or expired mcp-session-id, re-initialise"},
                        })),
                    );
                }
            }
        } else if method != "ping" {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32000, "message": "missing mcp-session-id header"},
                })),
            );
        }
    }

    let (result, new_session_id) = match method {
        "initialize" => {
            let session_id = uuid::Uuid::new_v4().to_string();
            let protocol_version = params
                .get("protocolVersion")
                .and_then(|v| v.as_str())
                .unwrap_or(MCP_PROTOCOL_VERSION)
                .to_string();
            let mut sessions = state.mcp_sessions.write().await;
            sessions.insert(
                session_id.clone(),
                McpSession {
                    session_id: session_id.clone(),
                    created_at: Instant::now(),
                    last_access: Instant::now(),
                    protocol_version: protocol_version.clone(),
                    client_info: params.get("clientInfo").cloned(),
                },
            );
            (
                Ok(json!({
                    "protocolVersion": protocol_version,
                    "capabilities": {
                        "tools": {"listChanged": false},
                        "resources": {"subscribe": false, "listChanged": false},
                    },
                    "serverInfo": {"name": MCP_SERVER_NAME, "version": env!("CARGO_PKG_VERSION")},
                })),
                Some(session_id),
            )
        }
        "notifications/initialized" => {
            return (StatusCode::OK, Json(json!(null)));
        }
        "ping" => (Ok(json!({})), None),
        "tools/list" => (handle_tools_list(), None),
        "tools/call" => (handle_tools_call(&state, &params).await, None),
        "resources/list" => (handle_resources_list(), None),
        "resources/read" => (handle_resources_read(&state, &params).await, None),
        _ => (
            Err(json!({"code": -32601, "message": "method not found"})),
            None,
        ),
    };

    let mut response = match result {
        Ok(value) => match &id {
            Some(id) => json!({"jsonrpc": "2.0", "id": id, "result": value}),
            None => json!(null),
        },
        Err(error) => match &id {
            Some(id) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
            None => json!(null),
        },
    };

    if let (Some(session_id), Value::Object(map)) = (&new_session_id, &mut response) {
        map.insert("sessionId".to_string(), json!(session_id));
    }

    (StatusCode::OK, Json(response))
}

fn handle_tools_list() -> Result<Value, Value> {
    let tools: Vec<Value> = tools::registry()
        .into_iter()
        .map(|t| json!({"name": t.name, "description": t.description, "inputSchema": t.input_schema}))
        .collect();
    Ok(json!({ "tools": tools }))
}

async fn handle_tools_call(state: &AppState, params: &Value) -> Result<Value, Value> {
    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| json!({"code": -32602, "message": "missing 'name' parameter"}))?;
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    let outcome = tokio::time::timeout(tools::TOOL_CALL_TIMEOUT, tools::call(state, name, &arguments)).await;

    let (text, is_error) = match outcome {
        Ok(Ok(value)) => (serde_json::to_string(&value).unwrap_or_default(), false),
        Ok(Err(e)) => (e.to_string(), true),
        Err(_) => (format!("tool '{name}' timed out after {:?}", tools::TOOL_CALL_TIMEOUT), true),
    };

    Ok(json!({ "content": [{"type": "text", "text": text}], "isError": is_error }))
}

fn handle_resources_list() -> Result<Value, Value> {
    Ok(json!({
        "resources": [
            {
                "uri": "chitty://contexts/recent",
                "name": "Recently active contexts",
                "description": "The most recently active context entities",
                "mimeType": "application/json",
            },
            {
                "uri": "chitty://sessions/active",
                "name": "Active MCP sessions",
                "description": "Currently live MCP session handles on this instance",
                "mimeType": "application/json",
            },
        ],
    }))
}

async fn handle_resources_read(state: &AppState, params: &Value) -> Result<Value, Value> {
    let uri = params
        .get("uri")
        .and_then(|v| v.as_str())
        .ok_or_else(|| json!({"code": -32602, "message": "missing 'uri' parameter"}))?;

    match uri {
        "chitty://contexts/recent" => {
            let contexts = state
                .resolver
                .search(None, Some("active"), 20)
                .await
                .map_err(|e| json!({"code": -32000, "message": e.to_string()}))?;
            Ok(json!({"contents": [{"uri": uri, "mimeType": "application/json", "text": serde_json::to_string(&contexts).unwrap_or_default()}]}))
        }
        "chitty://sessions/active" => {
            let sessions = state.mcp_sessions.read().await;
            let ids: Vec<&str> = sessions.keys().map(|s| s.as_str()).collect();
            Ok(json!({"contents": [{"uri": uri, "mimeType": "application/json", "text": serde_json::to_string(&ids).unwrap_or_default()}]}))
        }
        other => Err(json!({"code": -32602, "message": format!("unknown resource uri '{other}'")})),
    }
}

/// `GET /mcp` — the Streamable HTTP server-push leg. V1 emits a single
/// `connected` keepalive event and closes; tool calls never stream (§4.E).
pub async fn mcp_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl stream::Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let Some(session_id) = session_id_header(&headers) else {
        return Err(StatusCode::BAD_REQUEST);
    };
    let sessions = state.mcp_sessions.read().await;
    if !sessions.contains_key(&session_id) {
        return Err(StatusCode::NOT_FOUND);
    }
    drop(sessions);

    let event = Event::default().event("connected").data(session_id);
    Ok(Sse::new(stream::once(async move { Ok(event) })))
}

/// `DELETE /mcp` — terminate a session immediately rather than waiting for
/// idle eviction.
pub async fn mcp_terminate(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    let Some(session_id) = session_id_header(&headers) else {
        return StatusCode::BAD_REQUEST;
    };
    let mut sessions = state.mcp_sessions.write().await;
    if sessions.remove(&session_id).is_some() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

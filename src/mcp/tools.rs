//! Static MCP tool registry (§4.E). Handlers dispatch through the same
//! resolver/credential-broker calls the Composite API handlers use (§4.F),
//! never straight to a backend service, so auth/rate-limit/breaker policy
//! stays uniform regardless of transport.

use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::models::{AnchorHints, DecommissionAction, SessionMetrics, UnbindReason};
use crate::state::AppState;

pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

pub fn registry() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "context_resolve",
            description: "Resolve anchors to an existing context or a pending-creation candidate",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "projectPath": {"type": "string"},
                    "workspace": {"type": "string"},
                    "supportType": {"type": "string"},
                    "organization": {"type": "string"},
                    "explicitChittyId": {"type": "string"},
                },
            }),
        },
        ToolDef {
            name: "context_bind",
            description: "Bind a session to a context, creating the context first if it doesn't exist",
            input_schema: json!({
                "type": "object",
                "required": ["sessionId"],
                "properties": {
                    "sessionId": {"type": "string"},
                    "contextId": {"type": "string"},
                    "platform": {"type": "string"},
                },
            }),
        },
        ToolDef {
            name: "context_unbind",
            description: "Unbind a session, rolling its metrics into the context's DNA and trust score",
            input_schema: json!({
                "type": "object",
                "required": ["sessionId", "metrics"],
                "properties": {
                    "sessionId": {"type": "string"},
                    "metrics": {"type": "object"},
                },
            }),
        },
        ToolDef {
            name: "context_search",
            description: "Search contexts by support type and status",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "supportType": {"type": "string"},
                    "status": {"type": "string"},
                    "limit": {"type": "integer"},
                },
            }),
        },
        ToolDef {
            name: "credential_get",
            description: "Retrieve a short-lived service token from the credential broker",
            input_schema: json!({
                "type": "object",
                "required": ["service"],
                "properties": {"service": {"type": "string"}},
            }),
        },
        ToolDef {
            name: "credential_validate",
            description: "Validate a previously provisioned credential by tokenId",
            input_schema: json!({
                "type": "object",
                "required": ["tokenId"],
                "properties": {"tokenId": {"type": "string"}},
            }),
        },
    ]
}

/// Dispatches a `tools/call` request. Response bodies follow the MCP tool
/// content convention — callers wrap the returned value as
/// `{content:[{type:"text", text: JSON(value)}], isError}`.
pub async fn call(state: &AppState, name: &str, arguments: &Value) -> Result<Value, BrokerError> {
    match name {
        "context_resolve" => {
            let hints: AnchorHints = serde_json::from_value(arguments.clone())
                .map_err(|e| BrokerError::validation(format!("invalid arguments: {e}")))?;
            let result = state.resolver.resolve(&hints).await?;
            Ok(serde_json::to_value(result).unwrap_or(json!(null)))
        }
        "context_bind" => {
            let session_id = arguments
                .get("sessionId")
                .and_then(|v| v.as_str())
                .ok_or_else(|| BrokerError::validation("sessionId is required"))?;
            let platform = arguments.get("platform").and_then(|v| v.as_str());
            let context_id = arguments
                .get("contextId")
                .and_then(|v| v.as_str())
                .ok_or_else(|| BrokerError::validation("contextId is required"))?;
            let context_id: Uuid = context_id
                .parse()
                .map_err(|_| BrokerError::validation("contextId must be a UUID"))?;
            let binding = state.resolver.bind_session(context_id, session_id, platform).await?;
            Ok(serde_json::to_value(binding).unwrap_or(json!(null)))
        }
        "context_unbind" => {
            let session_id = arguments
                .get("sessionId")
                .and_then(|v| v.as_str())
                .ok_or_else(|| BrokerError::validation("sessionId is required"))?;
            let metrics: SessionMetrics = serde_json::from_value(
                arguments.get("metrics").cloned().unwrap_or(json!({})),
            )
            .map_err(|e| BrokerError::validation(format!("invalid metrics: {e}")))?;
            let rollup = state
                .resolver
                .unbind_session(session_id, &metrics, UnbindReason::SessionComplete)
                .await?;
            Ok(serde_json::to_value(rollup).unwrap_or(json!(null)))
        }
        "context_search" => {
            let support_type = arguments.get("supportType").and_then(|v| v.as_str());
            let status = arguments.get("status").and_then(|v| v.as_str());
            let limit = arguments.get("limit").and_then(|v| v.as_i64()).unwrap_or(20);
            let contexts = state.resolver.search(support_type, status, limit).await?;
            Ok(serde_json::to_value(contexts).unwrap_or(json!([])))
        }
        "credential_get" => {
            let service = arguments
                .get("service")
                .and_then(|v| v.as_str())
                .ok_or_else(|| BrokerError::validation("service is required"))?;
            let token = state.credentials.get_service_token(service).await?;
            Ok(json!({ "service": service, "token": token }))
        }
        "credential_validate" => {
            let token_id = arguments
                .get("tokenId")
                .and_then(|v| v.as_str())
                .ok_or_else(|| BrokerError::validation("tokenId is required"))?;
            let status = state.credentials.validate(token_id).await?;
            Ok(json!({ "tokenId": token_id, "status": status }))
        }
        _ => Err(BrokerError::not_found(format!("unknown tool '{name}'"))),
    }
}

/// Used by `context_unbind`'s decommission sibling on the Composite API —
/// exposed here only so both surfaces agree on the action vocabulary.
pub fn parse_decommission_action(value: &str) -> Result<DecommissionAction, BrokerError> {
    match value {
        "archive" => Ok(DecommissionAction::Archive),
        "revoke" => Ok(DecommissionAction::Revoke),
        other => Err(BrokerError::validation(format!("unknown decommission action '{other}'"))),
    }
}

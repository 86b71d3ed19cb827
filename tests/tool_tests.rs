//! MCP tool registry and dispatch (§4.E) — the `tools/list` and `tools/call`
//! surface exposed over the Streamable HTTP transport.

use chitty_context_broker::mcp::tools;
use chitty_context_broker::state::AppState;
use serde_json::json;

#[test]
fn registry_exposes_context_and_credential_tools() {
    let names: Vec<&str> = tools::registry().into_iter().map(|t| t.name).collect();
    assert!(names.contains(&"context_resolve"));
    assert!(names.contains(&"context_bind"));
    assert!(names.contains(&"context_unbind"));
    assert!(names.contains(&"context_search"));
    assert!(names.contains(&"credential_get"));
    assert!(names.contains(&"credential_validate"));
}

#[test]
fn every_tool_declares_a_json_schema_object() {
    for tool in tools::registry() {
        assert_eq!(
            tool.input_schema.get("type").and_then(|v| v.as_str()),
            Some("object"),
            "tool '{}' should declare an object input schema",
            tool.name
        );
    }
}

#[tokio::test]
async fn call_rejects_unknown_tool_name() {
    let state = AppState::new_test();
    let err = tools::call(&state, "not_a_real_tool", &json!({}))
        .await
        .expect_err("unknown tool name must fail");
    assert_eq!(err.kind(), chitty_context_broker::error::ErrorKind::NotFound);
}

#[tokio::test]
async fn credential_get_falls_back_to_env_variable() {
    unsafe {
        std::env::set_var("CHITTY_MCPTESTSVC_TOKEN", "mcp-env-token");
    }
    let state = AppState::new_test();

    let result = tools::call(&state, "credential_get", &json!({ "service": "mcptestsvc" }))
        .await
        .expect("env fallback should satisfy credential_get");

    assert_eq!(result["token"], "mcp-env-token");
    unsafe {
        std::env::remove_var("CHITTY_MCPTESTSVC_TOKEN");
    }
}

#[tokio::test]
async fn context_bind_requires_session_id() {
    let state = AppState::new_test();
    let err = tools::call(&state, "context_bind", &json!({ "contextId": uuid::Uuid::new_v4().to_string() }))
        .await
        .expect_err("missing sessionId must fail validation");
    assert_eq!(err.kind(), chitty_context_broker::error::ErrorKind::Validation);
}

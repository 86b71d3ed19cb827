//! Composite API Surface integration tests: API key auth, credential
//! retrieval, webhook intake, and request validation, all exercised through
//! the real router with `AppState::new_test()` (lazy DB pool, in-memory KV).

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use chitty_context_broker::state::AppState;

const API_KEY_HEADER: &str = "x-chittyos-api-key";

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Seeds an active API key record directly in the test state's in-memory KV,
/// mirroring how `key:{apiKey}` records are provisioned out of band (§6).
async fn state_with_active_key(api_key: &str) -> AppState {
    let state = AppState::new_test();
    let record = json!({ "status": "active", "scopes": [], "owner": "test-suite" });
    state
        .kv
        .put(&format!("key:{api_key}"), serde_json::to_vec(&record).unwrap(), None)
        .await
        .unwrap();
    state
}

#[tokio::test]
async fn protected_route_without_api_key_is_rejected() {
    let app = chitty_context_broker::create_router(AppState::new_test());

    let response = app
        .oneshot(Request::builder().uri("/api/v1/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn protected_route_with_unknown_api_key_is_rejected() {
    let app = chitty_context_broker::create_router(AppState::new_test());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/sessions")
                .header(API_KEY_HEADER, "not-a-real-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn credential_retrieve_falls_back_to_env_variable() {
    // No vault reachable in the test harness; CHITTY_{SERVICE}_TOKEN fallback
    // (§4.C) must still succeed.
    unsafe {
        std::env::set_var("CHITTY_WIDGETSVC_TOKEN", "env-fallback-token");
    }
    let state = state_with_active_key("test-key-1").await;
    let app = chitty_context_broker::create_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/credentials/retrieve?service=widgetsvc")
                .header(API_KEY_HEADER, "test-key-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["token"], "env-fallback-token");
    unsafe {
        std::env::remove_var("CHITTY_WIDGETSVC_TOKEN");
    }
}

#[tokio::test]
async fn credential_retrieve_without_vault_or_env_is_config_unavailable() {
    let state = state_with_active_key("test-key-2").await;
    let app = chitty_context_broker::create_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/credentials/retrieve?service=totally-unconfigured-service")
                .header(API_KEY_HEADER, "test-key-2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "CONFIG_UNAVAILABLE");
}

#[tokio::test]
async fn webhook_receive_accepts_envelope_and_enqueues() {
    let state = state_with_active_key("test-key-3").await;
    let app = chitty_context_broker::create_router(state);

    let envelope = json!({
        "deliveryId": "delivery-001",
        "eventType": "context.updated",
        "payload": {"foo": "bar"},
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/webhooks")
                .header(API_KEY_HEADER, "test-key-3")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&envelope).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["deliveryId"], "delivery-001");
    assert_eq!(body["data"]["accepted"], true);
}

#[tokio::test]
async fn decommission_rejects_unknown_action_before_touching_storage() {
    let state = state_with_active_key("test-key-4").await;
    let app = chitty_context_broker::create_router(state);

    let id = uuid::Uuid::new_v4();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/context/{id}/decommission"))
                .header(API_KEY_HEADER, "test-key-4")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&json!({"action": "nuke"})).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "VALIDATION");
}

#[tokio::test]
async fn batch_rejects_empty_request_list() {
    let state = state_with_active_key("test-key-5").await;
    let app = chitty_context_broker::create_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/batch")
                .header(API_KEY_HEADER, "test-key-5")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&json!({"requests": []})).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "VALIDATION");
}

#[tokio::test]
async fn batch_rejects_more_than_ten_sub_requests() {
    let state = state_with_active_key("test-key-6").await;
    let app = chitty_context_broker::create_router(state);

    let requests: Vec<Value> = (0..11)
        .map(|_| json!({ "op": "credentials.validate", "body": { "token_id": "x" } }))
        .collect();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/batch")
                .header(API_KEY_HEADER, "test-key-6")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&json!({"requests": requests})).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "VALIDATION");
}

#[tokio::test]
async fn batch_reports_multi_status_on_unknown_operation() {
    let state = state_with_active_key("test-key-7").await;
    let app = chitty_context_broker::create_router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/batch")
                .header(API_KEY_HEADER, "test-key-7")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({"requests": [{"op": "nonexistent.op", "body": {}}]})).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::MULTI_STATUS);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["data"]["operations"][0]["success"], json!(false));
}

#[tokio::test]
async fn kv_rate_limiter_rejects_once_identity_exceeds_the_minute_budget() {
    let mut state = state_with_active_key("test-key-8").await;
    state.config.rate_limit_per_minute = 2;
    let app = chitty_context_broker::create_router(state);

    let request = || {
        Request::builder()
            .uri("/api/v1/credentials/retrieve?service=totally-unconfigured-service")
            .header(API_KEY_HEADER, "test-key-8")
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(request()).await.unwrap();
        assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    let response = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "RATE_LIMIT");
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = chitty_context_broker::create_router(AppState::new_test());

    let response = app
        .oneshot(Request::builder().uri("/api/v1/nonexistent").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

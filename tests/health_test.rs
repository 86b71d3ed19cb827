//! Liveness, readiness, and discovery — the routes mounted outside the API
//! key middleware.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use chitty_context_broker::state::AppState;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_check_is_alive_without_touching_storage() {
    let app = chitty_context_broker::create_router(AppState::new_test());

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "alive");
    assert_eq!(body["service"], "chitty-context-broker");
}

#[tokio::test]
async fn readiness_reports_unavailable_when_dependencies_are_unreachable() {
    let app = chitty_context_broker::create_router(AppState::new_test());

    let response = app
        .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();

    // The test harness points at an unreachable Postgres instance, so the
    // database check fails and readiness must reflect that honestly.
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["ready"], false);
    assert_eq!(body["checks"]["database"], false);
}

#[tokio::test]
async fn service_discovery_document_advertises_api_and_mcp() {
    let app = chitty_context_broker::create_router(AppState::new_test());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/.well-known/chitty.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["endpoints"]["mcp"], "/mcp");
    assert_eq!(body["endpoints"]["api"], "/api/v1");
}

#[tokio::test]
async fn unknown_route_is_a_plain_404() {
    let app = chitty_context_broker::create_router(AppState::new_test());

    let response = app
        .oneshot(Request::builder().uri("/nonexistent").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

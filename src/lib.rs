pub mod audit;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod identifiers;
pub mod mcp;
pub mod minting;
pub mod models;
pub mod queue;
pub mod rate_limit;
pub mod resolver;
pub mod state;
pub mod storage;
pub mod webhook;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use error::BrokerError;
use handlers::{batch, context, credentials as credentials_handlers, documents, health, proxy, sessions, webhook as webhook_handlers};
use state::AppState;

/// Generates a correlation id for every request (§10.1) — honours an
/// incoming `X-Request-Id`, otherwise mints a UUIDv4. Recorded on the
/// tracing span and echoed back on the response.
async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    req.headers_mut().insert(
        "x-request-id",
        axum::http::HeaderValue::from_str(&request_id).unwrap_or_else(|_| axum::http::HeaderValue::from_static("invalid")),
    );
    tracing::Span::current().record("request_id", &request_id.as_str());

    let mut response = next.run(req).await;
    if let Ok(header_value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", header_value);
    }
    response
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "ChittyOS Context Broker",
        version = "1.0.0",
        description = "Multi-tenant context-and-credential broker — resolves sessions to persistent context entities, brokers vault credentials, and fans out to backend services with retries, breakers and rate limiting.",
        license(name = "MIT")
    ),
    paths(handlers::health::health_check, handlers::health::readiness, handlers::health::service_discovery),
    components(schemas(
        models::ContextStatus,
        models::ContextEntity,
        models::ContextDna,
        models::LedgerEventType,
        models::ContextLedgerEntry,
        models::UnbindReason,
        models::ContextSessionBinding,
        models::TrustEvolutionEntry,
        models::CredentialAuditEntry,
        models::McpSession,
        models::SessionMetrics,
        models::AnchorHints,
        models::SessionRecord,
        models::Anchors,
        models::PendingContext,
        models::ResolutionResult,
        models::RollupResult,
        models::LifecycleKind,
        models::DecommissionPreview,
        models::DecommissionAction,
        models::DocumentRecord,
        models::DeadLetterEntry,
        models::ApiKeyRecord,
        models::ApiKeyStatus,
    )),
    tags(
        (name = "health", description = "Liveness, readiness and service discovery"),
        (name = "context", description = "Context resolution, binding and lifecycle"),
        (name = "credentials", description = "Credential provisioning and audit"),
        (name = "sessions", description = "Durable session CRUD"),
        (name = "documents", description = "Document storage"),
        (name = "proxy", description = "Resilient outbound proxy"),
        (name = "webhooks", description = "Inbound webhook intake"),
        (name = "mcp", description = "Model Context Protocol transport"),
    )
)]
pub struct ApiDoc;

/// Builds the application router over a given [`AppState`]. Split out of
/// `main()` so integration tests construct the app without binding a port.
pub fn create_router(state: AppState) -> Router {
    // ── Per-route governor tiers (§10.6) — fast, process-local reject guard
    // layered in front of the KV-backed token-bucket limiter (§4.B) which
    // remains the cross-instance source of truth for P9.
    let governor_default = GovernorConfigBuilder::default()
        .per_millisecond(500)
        .burst_size(120)
        .finish()
        .expect("rate limiter config: default");
    let governor_mutating = GovernorConfigBuilder::default()
        .per_second(1)
        .burst_size(30)
        .finish()
        .expect("rate limiter config: mutating");
    let governor_mcp = GovernorConfigBuilder::default()
        .per_millisecond(200)
        .burst_size(60)
        .finish()
        .expect("rate limiter config: mcp");
    let governor_webhook = GovernorConfigBuilder::default()
        .per_second(2)
        .burst_size(50)
        .finish()
        .expect("rate limiter config: webhook");

    // ── Public discovery routes (§6) — no auth, no API key required ──────
    let public = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness))
        .route("/.well-known/chitty.json", get(health::service_discovery))
        .route("/openapi.json", get(openapi_json))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // ── Context Resolver API (§4.D, §4.F) ─────────────────────────────────
    let context_routes = Router::new()
        .route("/api/v1/context/resolve", post(context::resolve))
        .route("/api/v1/context/create", post(context::create))
        .route("/api/v1/context/bind", post(context::bind))
        .route("/api/v1/context/unbind", post(context::unbind))
        .route("/api/v1/context/switch", post(context::switch))
        .route("/api/v1/context/search", get(context::search))
        .route("/api/v1/context/current/{sessionId}", get(context::current))
        .route("/api/v1/context/lifecycle/supernova", post(context::supernova))
        .route("/api/v1/context/lifecycle/fission", post(context::fission))
        .route("/api/v1/context/lifecycle/derivative", post(context::derivative))
        .route("/api/v1/context/lifecycle/suspension", post(context::suspension))
        .route("/api/v1/context/{id}", get(context::get_context))
        .route("/api/v1/context/{id}/decommission/preview", get(context::decommission_preview))
        .route("/api/v1/context/{id}/decommission", post(context::decommission))
        .layer(GovernorLayer::new(governor_mutating));

    // ── Credential Broker API (§4.C, §4.F) ────────────────────────────────
    let credential_routes = Router::new()
        .route("/api/v1/credentials/retrieve", get(credentials_handlers::retrieve))
        .route("/api/v1/credentials/provision", post(credentials_handlers::provision))
        .route("/api/v1/credentials/validate", get(credentials_handlers::validate))
        .route("/api/v1/credentials/revoke", post(credentials_handlers::revoke))
        .route("/api/v1/credentials/audit", get(credentials_handlers::audit))
        .route("/api/v1/credentials/audit/{tokenId}", get(credentials_handlers::audit_for_token))
        .layer(GovernorLayer::new(governor_mutating));

    // ── Durable session CRUD (§4.F) ───────────────────────────────────────
    let session_routes = Router::new()
        .route("/api/v1/sessions", get(sessions::list).post(sessions::create))
        .route(
            "/api/v1/sessions/{id}",
            get(sessions::get).patch(sessions::update).delete(sessions::delete),
        )
        .layer(GovernorLayer::new(governor_default));

    // ── Documents delegated to the object store (§4.A, §4.F) ─────────────
    let document_routes = Router::new()
        .route("/api/v1/contexts/{contextId}/documents/{docType}", post(documents::upload))
        .route("/api/v1/contexts/{contextId}/documents", get(documents::list))
        .route("/api/v1/documents/{id}", get(documents::get_metadata).delete(documents::delete))
        .route("/api/v1/documents/{id}/content", get(documents::get_content))
        .layer(GovernorLayer::new(governor_default))
        .layer(DefaultBodyLimit::max(25 * 1024 * 1024));

    // ── Resilient proxy surface (§4.B, §4.F) ──────────────────────────────
    let proxy_routes = Router::new()
        .route("/api/proxy/{service}/{*path}", axum::routing::any(proxy::forward))
        .layer(GovernorLayer::new(governor_default));

    // ── Inbound webhook intake (§4.G) ─────────────────────────────────────
    let webhook_routes = Router::new()
        .route("/api/v1/webhooks", post(webhook_handlers::receive))
        .layer(GovernorLayer::new(governor_webhook));

    // ── Composite batch runner (§4.F) ─────────────────────────────────────
    let batch_routes = Router::new()
        .route("/api/v1/batch", post(batch::run))
        .layer(GovernorLayer::new(governor_mutating));

    let protected = context_routes
        .merge(credential_routes)
        .merge(session_routes)
        .merge(document_routes)
        .merge(proxy_routes)
        .merge(webhook_routes)
        .merge(batch_routes)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    // ── MCP Streamable HTTP transport (§4.E) — own auth gate since
    // `mcp-session-id` plays a role analogous to the API key once a
    // session is initialised; initial `initialize` still requires the key.
    let mcp_routes = Router::new()
        .route(
            "/mcp",
            post(mcp::server::mcp_handler)
                .get(mcp::server::mcp_stream)
                .delete(mcp::server::mcp_terminate),
        )
        .layer(GovernorLayer::new(governor_mcp))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    // ── Diagnostic surface (§10.5) — gated behind the same auth as other
    // protected routes, distinct from the public `/health` liveness check.
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    let cors = build_cors_layer(&state);

    public
        .merge(protected)
        .merge(mcp_routes)
        .merge(metrics_routes)
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            axum::http::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            axum::http::HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::REFERRER_POLICY,
            axum::http::HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CONTENT_SECURITY_POLICY,
            axum::http::HeaderValue::from_static("default-src 'self'"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::STRICT_TRANSPORT_SECURITY,
            axum::http::HeaderValue::from_static("max-age=63072000; includeSubDomains"),
        ))
        .with_state(state)
}

fn build_cors_layer(state: &AppState) -> CorsLayer {
    let origins = &state.config.cors_allowed_origins;
    let allow_origin = if origins.is_empty() {
        AllowOrigin::exact("null".parse().expect("static header value"))
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()).collect::<Vec<_>>())
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static("x-chittyos-api-key"),
            axum::http::HeaderName::from_static("mcp-session-id"),
        ])
        .max_age(std::time::Duration::from_secs(86_400))
}

async fn openapi_json() -> axum::Json<utoipa::openapi::OpenApi> {
    axum::Json(ApiDoc::openapi())
}

/// `GET /metrics` — plaintext diagnostic surface (§10.5): circuit breaker
/// states, credential cache occupancy, MCP session count. Not a Prometheus
/// exposition-format endpoint — a human/operator-readable snapshot, as in
/// the teacher's own plaintext metrics handler.
async fn metrics_handler(State(state): State<AppState>) -> Result<String, BrokerError> {
    let breakers = state.gateway.snapshot().await;
    let mcp_session_count = state.mcp_sessions.read().await.len();
    let credential_cache_entries = state.credentials.cache_len();

    let mut out = String::new();
    out.push_str("# chitty-context-broker diagnostic snapshot\n");
    out.push_str(&format!("mcp_session_count {mcp_session_count}\n"));
    out.push_str(&format!("credential_cache_entries {credential_cache_entries}\n"));
    for (service, breaker_state) in breakers {
        out.push_str(&format!("circuit_breaker{{service=\"{service}\"}} {breaker_state:?}\n"));
    }
    Ok(out)
}

//! Resilient proxy surface (§4.B, §4.F) — `/api/proxy/{service}/*path`
//! forwards to a downstream backend through the outbound gateway, so callers
//! get breaker/retry/backoff behavior without reimplementing it per service.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;

use crate::error::BrokerError;
use crate::gateway::CallOptions;
use crate::state::AppState;

/// Backend base URLs are resolved from `CHITTY_PROXY_{SERVICE}_URL`; a
/// service with no configured base URL can't be proxied to.
fn backend_base_url(service: &str) -> Result<String, BrokerError> {
    let var = format!("CHITTY_PROXY_{}_URL", service.to_uppercase());
    std::env::var(&var).map_err(|_| {
        BrokerError::config_unavailable(format!("no backend configured for proxied service '{service}' (set {var})"))
    })
}

fn forward_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

/// `{METHOD} /api/proxy/{service}/*path`
pub async fn forward(
    State(state): State<AppState>,
    Path((service, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, BrokerError> {
    let base = backend_base_url(&service)?;
    let url = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));

    let gateway_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| BrokerError::validation(e.to_string()))?;

    let opts = CallOptions {
        method: gateway_method,
        headers: forward_headers(&headers),
        body: if body.is_empty() { None } else { Some(body.to_vec()) },
    };

    let resp = state.gateway.call(&service, &url, opts).await?;

    let status = StatusCode::from_u16(resp.status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = resp
        .headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    Ok((status, [(axum::http::header::CONTENT_TYPE, content_type)], resp.body))
}

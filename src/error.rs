//! Canonical error taxonomy shared by every component.
//!
//! Storage and the outbound gateway return narrower, typed errors; at each
//! component boundary those get mapped onto [`ErrorKind`] exactly once so the
//! HTTP status mapping lives in a single place.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimit,
    Auth,
    Validation,
    NotFound,
    Conflict,
    Permission,
    Server,
    ConfigUnavailable,
    Unknown,
}

impl ErrorKind {
    /// Whether the outbound gateway should retry a call that failed this way.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server | ErrorKind::Unknown
        )
    }

    /// Whether this counts as a circuit-breaker failure (§4.B: 4xx other than
    /// 429 never trips the breaker).
    pub fn counts_as_breaker_failure(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server | ErrorKind::Unknown
        )
    }

    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::Permission => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ConfigUnavailable | ErrorKind::Server => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Unknown => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

/// The error type returned at every component boundary and converted directly
/// into an HTTP response via [`IntoResponse`].
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("{message}")]
    Kind {
        kind: ErrorKind,
        message: String,
        details: Option<serde_json::Value>,
        breaker_open: bool,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        BrokerError::Kind {
            kind,
            message: message.into(),
            details: None,
            breaker_open: false,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        if let BrokerError::Kind { details: d, .. } = &mut self {
            *d = Some(details);
        }
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn config_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigUnavailable, message)
    }

    pub fn breaker_open(service: &str) -> Self {
        BrokerError::Kind {
            kind: ErrorKind::Server,
            message: format!("circuit breaker open for service '{service}'"),
            details: None,
            breaker_open: true,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Kind { kind, .. } => *kind,
            BrokerError::Internal(_) => ErrorKind::Unknown,
        }
    }
}

impl From<crate::storage::error::StorageError> for BrokerError {
    fn from(err: crate::storage::error::StorageError) -> Self {
        use crate::storage::error::StorageError as S;
        let kind = match err {
            S::NotFound(_) => ErrorKind::NotFound,
            S::Conflict(_) => ErrorKind::Conflict,
            S::Transient(_) => ErrorKind::Server,
            S::Permanent(_) => ErrorKind::Unknown,
        };
        BrokerError::new(kind, err.to_string())
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (kind, message, details, breaker_open) = match self {
            BrokerError::Kind { kind, message, details, breaker_open } => {
                (kind, message, details, breaker_open)
            }
            BrokerError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (ErrorKind::Unknown, "internal error".to_string(), None, false)
            }
        };

        let mut error_body = json!({ "code": kind, "message": message });
        if let Some(details) = details {
            error_body["details"] = details;
        }
        if breaker_open {
            error_body["breakerOpen"] = json!(true);
        }

        let body = json!({
            "success": false,
            "error": error_body,
            "_meta": {
                "requestId": request_id,
                "timestamp": chrono::Utc::now().timestamp(),
                "service": "chitty-context-broker",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });

        (kind.status_code(), Json(body)).into_response()
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

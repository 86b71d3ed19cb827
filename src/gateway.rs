//! Outbound Request Gateway (§4.B) — the single entry point every
//! component uses to reach a downstream backend service. Wraps `reqwest`
//! with a per-service circuit breaker, exponential backoff with jitter, and
//! error classification onto the [`crate::error::ErrorKind`] taxonomy.
//!
//! Breaker state is process-local (§5) — a `DashMap<String, Breaker>` guarded
//! internally per-entry, no cross-instance coordination.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{BrokerError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Set while a HalfOpen probe is in flight, so concurrent callers don't
    /// all get to probe at once.
    probe_in_flight: bool,
}

/// Per-service circuit breaker (§4.B). `failure_threshold` and
/// `reset_timeout` are tighter for identity/auth-classed services per spec.
pub struct Breaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl Breaker {
    fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            failure_threshold,
            reset_timeout,
        }
    }

    /// Returns `true` if a call should proceed; transitions Open → HalfOpen
    /// once `reset_timeout` has elapsed, admitting exactly one probe.
    async fn allow(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn record_success(&self, service: &str) {
        let mut inner = self.inner.lock().await;
        let prev = inner.state;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        inner.state = BreakerState::Closed;
        if prev != BreakerState::Closed {
            tracing::info!(service, from = ?prev, to = ?BreakerState::Closed, "gateway: breaker state change");
        }
    }

    async fn record_failure(&self, service: &str) {
        let mut inner = self.inner.lock().await;
        let prev = inner.state;
        inner.probe_in_flight = false;
        match prev {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
        if inner.state != prev {
            tracing::warn!(service, from = ?prev, to = ?inner.state, "gateway: breaker state change");
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }
}

/// Per-service breaker registry plus the shared `reqwest::Client` (§4.B, §5).
pub struct OutboundGateway {
    http: reqwest::Client,
    breakers: DashMap<String, Arc<Breaker>>,
    failure_threshold: u32,
    failure_threshold_identity: u32,
    reset_timeout: Duration,
    reset_timeout_identity: Duration,
    retry_max_attempts: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
    timeout: Duration,
}

/// Services whose breaker uses the tighter identity/auth thresholds (§4.B).
fn is_identity_service(service: &str) -> bool {
    matches!(service, "chittyid" | "vault" | "auth" | "identity")
}

pub struct CallOptions {
    pub method: reqwest::Method,
    pub headers: reqwest::header::HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            method: reqwest::Method::GET,
            headers: reqwest::header::HeaderMap::new(),
            body: None,
        }
    }
}

pub struct GatewayResponse {
    pub status: reqwest::StatusCode,
    pub headers: reqwest::header::HeaderMap,
    pub body: Vec<u8>,
}

impl OutboundGateway {
    pub fn new(http: reqwest::Client, config: &Config) -> Self {
        Self {
            http,
            breakers: DashMap::new(),
            failure_threshold: config.breaker_failure_threshold,
            failure_threshold_identity: config.breaker_failure_threshold_identity,
            reset_timeout: config.breaker_reset_timeout,
            reset_timeout_identity: config.breaker_reset_timeout_identity,
            retry_max_attempts: config.retry_max_attempts,
            retry_base_delay: config.retry_base_delay,
            retry_max_delay: config.retry_max_delay,
            timeout: config.outbound_timeout,
        }
    }

    fn breaker_for(&self, service: &str) -> Arc<Breaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let (threshold, reset) = if is_identity_service(service) {
                    (self.failure_threshold_identity, self.reset_timeout_identity)
                } else {
                    (self.failure_threshold, self.reset_timeout)
                };
                Arc::new(Breaker::new(threshold, reset))
            })
            .clone()
    }

    pub async fn breaker_state(&self, service: &str) -> BreakerState {
        self.breaker_for(service).state().await
    }

    /// Snapshot of every breaker that has been touched, for the diagnostic
    /// surface (§10.5).
    pub async fn snapshot(&self) -> Vec<(String, BreakerState)> {
        let mut out = Vec::new();
        for entry in self.breakers.iter() {
            out.push((entry.key().clone(), entry.value().state().await));
        }
        out
    }

    /// `call(service, url, opts)` (§4.B). Retries with exponential backoff
    /// and jitter on retryable classes; honors the circuit breaker.
    pub async fn call(
        &self,
        service: &str,
        url: &str,
        opts: CallOptions,
    ) -> Result<GatewayResponse, BrokerError> {
        let breaker = self.breaker_for(service);

        if !breaker.allow().await {
            return Err(BrokerError::breaker_open(service));
        }

        let mut attempt = 0u32;
        loop {
            let mut req = self
                .http
                .request(opts.method.clone(), url)
                .headers(opts.headers.clone())
                .timeout(self.timeout);
            if let Some(body) = &opts.body {
                req = req.body(body.clone());
            }

            let outcome = req.send().await;
            match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    let kind = classify_status(status);
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok());

                    if kind.counts_as_breaker_failure() {
                        breaker.record_failure(service).await;
                    } else {
                        breaker.record_success(service).await;
                    }

                    let should_retry = attempt + 1 < self.retry_max_attempts
                        && (kind.is_retryable()
                            || (kind == ErrorKind::RateLimit && retry_after.is_some()));

                    if status.is_success() || !should_retry {
                        let headers = resp.headers().clone();
                        let body = resp
                            .bytes()
                            .await
                            .map(|b| b.to_vec())
                            .unwrap_or_default();
                        if status.is_success() {
                            return Ok(GatewayResponse { status, headers, body });
                        }
                        return Err(classify_to_error(kind, status, &body));
                    }

                    let delay = retry_after
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| backoff_delay(attempt, self.retry_base_delay, self.retry_max_delay));
                    tracing::warn!(service, attempt, ?delay, status = %status, "gateway: retrying after failure response");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    let kind = classify_reqwest_error(&err);
                    breaker.record_failure(service).await;

                    let should_retry = attempt + 1 < self.retry_max_attempts && kind.is_retryable();
                    if !should_retry {
                        return Err(BrokerError::new(kind, err.to_string()));
                    }

                    let delay = backoff_delay(attempt, self.retry_base_delay, self.retry_max_delay);
                    tracing::warn!(service, attempt, ?delay, error = %err, "gateway: retrying after transport error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// `delay_n = min(baseDelay * 2^n, maxDelay) * (1 +/- 0.25)` (§4.B).
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << attempt.min(20));
    let capped = exp.min(max.as_millis());
    let jitter_frac = rand::thread_rng().gen_range(-0.25..=0.25);
    let jittered = (capped as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered.max(0.0) as u64)
}

/// Error classification (§7 taxonomy, applied to HTTP status codes).
pub fn classify_status(status: reqwest::StatusCode) -> ErrorKind {
    match status.as_u16() {
        200..=299 => ErrorKind::Unknown, // never surfaced: success path checked separately
        401 | 403 => ErrorKind::Auth,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        429 => ErrorKind::RateLimit,
        400..=499 => ErrorKind::Validation,
        500..=599 => ErrorKind::Server,
        _ => ErrorKind::Unknown,
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() {
        ErrorKind::Network
    } else {
        ErrorKind::Unknown
    }
}

fn classify_to_error(kind: ErrorKind, status: reqwest::StatusCode, body: &[u8]) -> BrokerError {
    let message = String::from_utf8_lossy(body).chars().take(500).collect::<String>();
    BrokerError::new(kind, format!("upstream returned {status}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_millis(30_000);
        for attempt in 0..10 {
            let d = backoff_delay(attempt, base, max);
            // jitter is +/-25%, so allow slack either side of the cap
            assert!(d.as_millis() <= (max.as_millis() as f64 * 1.26) as u128);
        }
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_rejects() {
        let breaker = Breaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(breaker.allow().await);
            breaker.record_failure("test").await;
        }
        assert!(!breaker.allow().await);
        assert_eq!(breaker.state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn breaker_half_open_probe_succeeds_closes_circuit() {
        let breaker = Breaker::new(1, Duration::from_millis(10));
        assert!(breaker.allow().await);
        breaker.record_failure("test").await;
        assert_eq!(breaker.state().await, BreakerState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.allow().await); // half-open probe admitted
        breaker.record_success("test").await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }
}

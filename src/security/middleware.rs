// ARCHITECTURE: Admission Middleware - HTTP Adapter for the Admission Gate
//
// Thin axum layer wiring the adaptive limiter and security metrics into the
// request path:
// 1. IDENTIFY: API key, then first X-Forwarded-For hop, then X-Real-IP
// 2. ADMIT: AdaptiveRateLimiter::allow; on denial record the block and answer 429
// 3. MEASURE: after the handler runs, feed latency and 5xx status to the load meter
//
// The gate also serves read-only stats for observability tooling.

use std::{sync::Arc, time::Instant};

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    adaptive::{AdaptiveRateLimiter, LoadStats},
    metrics::{SecurityMetrics, SecurityMetricsSnapshot, RATE_LIMIT_EXCEEDED},
    rate_limiter::RateLimiterStats,
};

// STATE: AdmissionGate - Handles Shared with the Middleware
#[derive(Clone)]
pub struct AdmissionGate {
    pub limiter: Arc<AdaptiveRateLimiter>,
    pub metrics: Arc<SecurityMetrics>,
}

impl AdmissionGate {
    pub fn new(limiter: Arc<AdaptiveRateLimiter>, metrics: Arc<SecurityMetrics>) -> Self {
        Self { limiter, metrics }
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            rate_limiter: self.limiter.limiter_stats(),
            load: self.limiter.load_stats(),
            security: self.metrics.snapshot(),
        }
    }

    // LIFECYCLE: Stop both background sweeps
    pub fn shutdown(&self) {
        self.limiter.stop();
        self.metrics.stop();
    }
}

// RESPONSE: AdmissionStats - Combined Observability Snapshot
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub rate_limiter: RateLimiterStats,
    pub load: LoadStats,
    pub security: SecurityMetricsSnapshot,
}

// CORE FUNCTION: Admission middleware handler
pub async fn admission_middleware(
    State(gate): State<AdmissionGate>,
    request: Request,
    next: Next,
) -> Response {
    let identifier = extract_identifier(request.headers());

    if !gate.limiter.allow(&identifier) {
        gate.metrics
            .record_blocked_request(&identifier, RATE_LIMIT_EXCEEDED);
        warn!(
            identifier = %identifier,
            path = %request.uri().path(),
            "Request rate limited"
        );
        let limiter = gate.limiter.limiter();
        let retry_after = limiter
            .refill_policy()
            .period(limiter.window())
            .as_secs()
            .max(1);
        return rate_limited_response(retry_after);
    }

    let start_time = Instant::now();
    let response = next.run(request).await;
    let elapsed = start_time.elapsed();
    let is_error = response.status().is_server_error();

    gate.limiter.record_request(elapsed, is_error);
    debug!(
        identifier = %identifier,
        status = %response.status(),
        processing_time_ms = elapsed.as_millis(),
        "Request admitted"
    );

    response
}

// Extract the rate limit subject from request headers
fn extract_identifier(headers: &HeaderMap) -> String {
    header_str(headers, "x-api-key")
        .or_else(|| {
            header_str(headers, "x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
        })
        .or_else(|| header_str(headers, "x-real-ip"))
        .unwrap_or("unknown")
        .to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn rate_limited_response(retry_after_seconds: u64) -> Response {
    let body = Json(json!({
        "error": "Rate limit exceeded",
        "code": "RATE_LIMITED",
        "retry_after": retry_after_seconds,
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_seconds));
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn admission_stats(State(gate): State<AdmissionGate>) -> Json<AdmissionStats> {
    Json(gate.stats())
}

// ROUTER: Health and observability endpoints
pub fn stats_router(gate: AdmissionGate) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admission/stats", get(admission_stats))
        .with_state(gate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    #[test]
    fn test_identifier_precedence() {
        assert_eq!(
            extract_identifier(&headers(&[
                ("x-api-key", "key-1"),
                ("x-forwarded-for", "1.1.1.1")
            ])),
            "key-1"
        );
        assert_eq!(
            extract_identifier(&headers(&[
                ("x-forwarded-for", "1.1.1.1 , 2.2.2.2"),
                ("x-real-ip", "3.3.3.3")
            ])),
            "1.1.1.1"
        );
        assert_eq!(
            extract_identifier(&headers(&[("x-real-ip", "3.3.3.3")])),
            "3.3.3.3"
        );
        assert_eq!(extract_identifier(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn test_rate_limited_response_headers() {
        let response = rate_limited_response(60);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
    }
}

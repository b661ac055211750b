// ARCHITECTURE: Security Module - Request Admission Gate
//
// DESIGN PHILOSOPHY:
// This module decides, per caller identifier, whether a request may proceed:
// 1. RATE LIMITING: Fixed-window token buckets, one per identifier
// 2. ADAPTIVE CAPACITY: Bucket capacity retuned from a live 0-100 load signal
// 3. SECURITY METRICS: Blocked requests counted per identifier and reason
// 4. HTTP GATE: axum middleware wiring the above into the request path
//
// Every component is an owned instance created once at startup and stopped once
// at shutdown. Admission and recording never block on I/O and never fail.

pub mod adaptive;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;
mod sweeper;

pub use adaptive::{capacity_for_load, AdaptiveConfig, AdaptiveRateLimiter, LoadMeter, LoadStats};
pub use metrics::{SecurityMetrics, SecurityMetricsConfig, SecurityMetricsSnapshot, RATE_LIMIT_EXCEEDED};
pub use middleware::{admission_middleware, stats_router, AdmissionGate, AdmissionStats};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats, RefillPolicy, TokenBucket};

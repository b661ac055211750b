pub mod config;
pub mod error;
pub mod security;

pub use config::GuardConfig;
pub use error::{Error, Result};
pub use security::{
    AdaptiveConfig, AdaptiveRateLimiter, AdmissionGate, RateLimiter, RateLimiterConfig,
    RefillPolicy, SecurityMetrics, SecurityMetricsConfig,
};

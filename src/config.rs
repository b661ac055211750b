use serde::{Deserialize, Serialize};
use std::{env, str::FromStr, sync::Arc, time::Duration};

use crate::error::{Error, Result};
use crate::security::{
    AdaptiveConfig, AdaptiveRateLimiter, AdmissionGate, RateLimiterConfig, RefillPolicy,
    SecurityMetrics, SecurityMetricsConfig,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    pub server: ServerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub adaptive: AdaptiveConfig,
    pub metrics: SecurityMetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
        }
    }
}

impl GuardConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each known key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("HOST") {
            config.server.host = host;
        }
        set_parsed(&lookup, "PORT", &mut config.server.port)?;
        if let Some(log_level) = lookup("LOG_LEVEL") {
            config.server.log_level = log_level;
        }

        set_secs(&lookup, "RATE_LIMIT_WINDOW_SECS", &mut config.rate_limiter.window)?;
        if let Some(policy) = lookup("RATE_LIMIT_REFILL") {
            config.rate_limiter.refill_policy = match policy.trim() {
                "minute" => RefillPolicy::FixedMinute,
                "window" => RefillPolicy::Window,
                _ => {
                    return Err(Error::Env {
                        key: "RATE_LIMIT_REFILL".to_string(),
                        value: policy,
                    })
                }
            };
        }

        set_parsed(&lookup, "ADAPTIVE_BASE_MAX_REQUESTS", &mut config.adaptive.base_max_requests)?;
        set_parsed(&lookup, "ADAPTIVE_MAX_MAX_REQUESTS", &mut config.adaptive.max_max_requests)?;
        set_parsed(&lookup, "ADAPTIVE_MIN_MAX_REQUESTS", &mut config.adaptive.min_max_requests)?;
        set_secs(&lookup, "ADAPTIVE_INTERVAL_SECS", &mut config.adaptive.adaptation_interval)?;

        // The gate's limiter starts at the adaptive base, so an explicit
        // RATE_LIMIT_MAX_REQUESTS must agree with it.
        config.rate_limiter.max_requests = config.adaptive.base_max_requests;
        set_parsed(&lookup, "RATE_LIMIT_MAX_REQUESTS", &mut config.rate_limiter.max_requests)?;

        set_secs(&lookup, "SECURITY_METRICS_RESET_SECS", &mut config.metrics.reset_interval)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limiter.validate()?;
        self.adaptive.validate()?;
        self.metrics.validate()?;

        if self.rate_limiter.max_requests != self.adaptive.base_max_requests {
            return Err(Error::InvalidConfig(format!(
                "rate limiter max_requests ({}) must equal adaptive base_max_requests ({})",
                self.rate_limiter.max_requests, self.adaptive.base_max_requests
            )));
        }
        Ok(())
    }

    /// Construct the admission components; background sweeps are not started.
    pub fn build_gate(&self) -> Result<AdmissionGate> {
        self.validate()?;
        let limiter = AdaptiveRateLimiter::new(self.rate_limiter.clone(), self.adaptive.clone())?;
        let metrics = SecurityMetrics::new(self.metrics.clone())?;
        Ok(AdmissionGate::new(Arc::new(limiter), Arc::new(metrics)))
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(key) {
        *target = value.trim().parse().map_err(|_| Error::Env {
            key: key.to_string(),
            value,
        })?;
    }
    Ok(())
}

fn set_secs<F>(lookup: &F, key: &str, target: &mut Duration) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let mut secs = target.as_secs();
    set_parsed(lookup, key, &mut secs)?;
    *target = Duration::from_secs(secs);
    Ok(())
}

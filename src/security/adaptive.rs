// ARCHITECTURE: Adaptive Rate Limiting - Load-Driven Capacity Tuning
//
// DESIGN PHILOSOPHY:
// The adaptive controller owns exactly one base RateLimiter and one LoadMeter.
// Request outcomes feed the meter; every admission check may retune the
// limiter's capacity from the meter's 0-100 load estimate:
//
//   load < 30        -> max_max_requests
//   30 <= load <= 80 -> linear from max_max_requests down to min_max_requests
//   load > 80        -> min_max_requests
//
// Retuning happens at most once per adaptation interval. Only buckets created
// after a retune see the new capacity.
//
// LOAD HEURISTIC:
// load = min(100, response_time_secs * 50 + error_rate * 100), using only the
// latest response time and the lifetime error rate. Errors never decay, so an
// early burst of failures keeps the estimate high until traffic dilutes it.

use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
use crate::error::{Error, Result};

const LOW_LOAD: f64 = 30.0;
const HIGH_LOAD: f64 = 80.0;
const MAX_LOAD: f64 = 100.0;

// CONFIGURATION: AdaptiveConfig - Capacity Bounds and Retune Cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub base_max_requests: u32,     // Starting capacity (default: 100)
    pub max_max_requests: u32,      // Capacity under low load (default: 200)
    pub min_max_requests: u32,      // Capacity under high load (default: 20)
    pub adaptation_interval: Duration, // Minimum time between retunes (default: 30s)
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            base_max_requests: 100,
            max_max_requests: 200,
            min_max_requests: 20,
            adaptation_interval: Duration::from_secs(30),
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_max_requests == 0 {
            return Err(Error::InvalidConfig(
                "adaptive min_max_requests must be positive".to_string(),
            ));
        }
        if self.min_max_requests > self.max_max_requests {
            return Err(Error::InvalidConfig(format!(
                "adaptive min_max_requests ({}) exceeds max_max_requests ({})",
                self.min_max_requests, self.max_max_requests
            )));
        }
        if !(self.min_max_requests..=self.max_max_requests).contains(&self.base_max_requests) {
            return Err(Error::InvalidConfig(format!(
                "adaptive base_max_requests ({}) outside [{}, {}]",
                self.base_max_requests, self.min_max_requests, self.max_max_requests
            )));
        }
        if self.adaptation_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "adaptive adaptation_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Capacity for a given load, never outside `[min, max]` and non-increasing in `load`.
pub fn capacity_for_load(load: f64, min: u32, max: u32) -> u32 {
    if load < LOW_LOAD {
        max
    } else if load > HIGH_LOAD {
        min
    } else {
        let factor = (HIGH_LOAD - load) / (HIGH_LOAD - LOW_LOAD);
        min + (factor * f64::from(max.saturating_sub(min))) as u32
    }
}

// STATS: LoadStats - Load Meter Snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadStats {
    pub current_load: f64,
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub response_time: Duration,
    pub max_requests: u32,
}

#[derive(Debug, Default)]
struct LoadState {
    request_count: u64,
    error_count: u64,
    response_time: Duration,
    current_load: f64,
}

impl LoadState {
    fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

// TRACKING: LoadMeter - Live 0-100 Load Estimate
#[derive(Debug, Default)]
pub struct LoadMeter {
    state: RwLock<LoadState>,
}

impl LoadMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, response_time: Duration, is_error: bool) {
        let mut state = self.state.write();
        state.request_count += 1;
        state.response_time = response_time;
        if is_error {
            state.error_count += 1;
        }

        let response_time_ms = response_time.as_secs_f64() * 1000.0;
        state.current_load =
            ((response_time_ms / 1000.0) * 50.0 + state.error_rate() * 100.0).min(MAX_LOAD);
    }

    /// Replace the measured load with an externally supplied one.
    pub fn set_load(&self, load: f64) {
        self.state.write().current_load = load;
    }

    pub fn current_load(&self) -> f64 {
        self.state.read().current_load
    }

    pub fn stats(&self, max_requests: u32) -> LoadStats {
        let state = self.state.read();
        LoadStats {
            current_load: state.current_load,
            request_count: state.request_count,
            error_count: state.error_count,
            error_rate: state.error_rate(),
            response_time: state.response_time,
            max_requests,
        }
    }
}

// CORE SYSTEM: AdaptiveRateLimiter - Controller Owning One Base Limiter
pub struct AdaptiveRateLimiter {
    config: AdaptiveConfig,
    limiter: RateLimiter,
    load: LoadMeter,
    last_update: Mutex<Instant>,
}

impl AdaptiveRateLimiter {
    // CONSTRUCTOR: Build the owned base limiter at base_max_requests
    pub fn new(limiter_config: RateLimiterConfig, config: AdaptiveConfig) -> Result<Self> {
        config.validate()?;
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests: config.base_max_requests,
            ..limiter_config
        })?;

        Ok(Self {
            config,
            limiter,
            load: LoadMeter::new(),
            last_update: Mutex::new(Instant::now()),
        })
    }

    pub fn start(&self) -> bool {
        self.limiter.start()
    }

    pub fn stop(&self) {
        self.limiter.stop();
    }

    // CORE FUNCTION: Maybe retune, then delegate to the base limiter
    pub fn allow(&self, identifier: &str) -> bool {
        self.update_limits();
        self.limiter.allow(identifier)
    }

    pub fn record_request(&self, response_time: Duration, is_error: bool) {
        self.load.record_request(response_time, is_error);
    }

    // API: Override the measured load and retune right away
    pub fn update_load(&self, load: f64) {
        if !load.is_finite() {
            warn!(load, "Ignoring non-finite load override");
            return;
        }
        let load = load.clamp(0.0, MAX_LOAD);
        self.load.set_load(load);
        *self.last_update.lock() = Instant::now();
        self.apply_load(load);
    }

    fn update_limits(&self) {
        let now = Instant::now();
        {
            let mut last_update = self.last_update.lock();
            if now.duration_since(*last_update) < self.config.adaptation_interval {
                return;
            }
            *last_update = now;
        }
        self.apply_load(self.load.current_load());
    }

    fn apply_load(&self, load: f64) {
        let capacity = capacity_for_load(
            load,
            self.config.min_max_requests,
            self.config.max_max_requests,
        );
        let previous = self.limiter.set_max_requests(capacity);

        if previous != capacity {
            info!(
                load,
                previous_max_requests = previous,
                max_requests = capacity,
                "Adapted rate limit capacity"
            );
        } else {
            debug!(load, max_requests = capacity, "Rate limit capacity unchanged");
        }
    }

    pub fn load_stats(&self) -> LoadStats {
        self.load.stats(self.limiter.max_requests())
    }

    pub fn limiter_stats(&self) -> RateLimiterStats {
        self.limiter.stats()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min: u32, max: u32) -> AdaptiveConfig {
        AdaptiveConfig {
            base_max_requests: min,
            max_max_requests: max,
            min_max_requests: min,
            adaptation_interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_zone_boundaries() {
        assert_eq!(capacity_for_load(0.0, 10, 100), 100);
        assert_eq!(capacity_for_load(29.999, 10, 100), 100);
        // Both ends of the interpolation zone are inclusive.
        assert_eq!(capacity_for_load(30.0, 10, 100), 100);
        assert_eq!(capacity_for_load(80.0, 10, 100), 10);
        assert_eq!(capacity_for_load(80.001, 10, 100), 10);
        assert_eq!(capacity_for_load(100.0, 10, 100), 10);
        assert_eq!(capacity_for_load(55.0, 10, 100), 55);
    }

    #[test]
    fn test_capacity_is_monotonic_and_bounded() {
        let mut previous = u32::MAX;
        for step in 0..=1000 {
            let load = f64::from(step) / 10.0;
            let capacity = capacity_for_load(load, 20, 200);
            assert!((20..=200).contains(&capacity), "load {load} -> {capacity}");
            assert!(capacity <= previous, "load {load} increased capacity");
            previous = capacity;
        }
    }

    #[test]
    fn test_load_meter_formula() {
        let meter = LoadMeter::new();
        meter.record_request(Duration::from_millis(200), false);
        assert!((meter.current_load() - 10.0).abs() < 1e-9);

        // 1 error in 2 requests: 50 from errors, 0 from latency.
        meter.record_request(Duration::ZERO, true);
        assert!((meter.current_load() - 50.0).abs() < 1e-9);

        meter.record_request(Duration::from_secs(3), true);
        assert_eq!(meter.current_load(), 100.0);

        let stats = meter.stats(42);
        assert_eq!(stats.request_count, 3);
        assert_eq!(stats.error_count, 2);
        assert_eq!(stats.response_time, Duration::from_secs(3));
        assert_eq!(stats.max_requests, 42);
    }

    #[test]
    fn test_config_validation() {
        assert!(AdaptiveConfig::default().validate().is_ok());
        assert!(config(0, 10).validate().is_err());
        assert!(config(50, 10).validate().is_err());

        let mut outside = config(10, 100);
        outside.base_max_requests = 101;
        assert!(outside.validate().is_err());

        let mut no_interval = config(10, 100);
        no_interval.adaptation_interval = Duration::ZERO;
        assert!(no_interval.validate().is_err());
    }

    #[test]
    fn test_limiter_starts_at_base_capacity() {
        let mut adaptive = config(10, 100);
        adaptive.base_max_requests = 40;
        let controller =
            AdaptiveRateLimiter::new(RateLimiterConfig::new(999, Duration::from_secs(60)), adaptive)
                .unwrap();
        assert_eq!(controller.load_stats().max_requests, 40);
    }

    #[test]
    fn test_non_finite_load_is_ignored() {
        let controller =
            AdaptiveRateLimiter::new(RateLimiterConfig::default(), config(10, 100)).unwrap();
        controller.update_load(90.0);
        controller.update_load(f64::NAN);
        assert_eq!(controller.load_stats().max_requests, 10);
        assert_eq!(controller.load_stats().current_load, 90.0);
    }
}

// ARCHITECTURE: Security Metrics - Blocked Request Bookkeeping
//
// Counts blocked requests per identifier and per reason, independently of the
// admission decision. Snapshots are owned deep copies taken under the read lock,
// so they are internally consistent and can't reach back into live state.
//
// RESET SEMANTICS:
// Every reset_interval the counters are zeroed and both maps cleared in one
// critical section. History is discarded, not decayed: callers that need
// cumulative numbers must persist snapshots before each reset boundary.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::sweeper::PeriodicTask;
use crate::error::{Error, Result};

/// Reason code recorded by the admission gate when a client runs out of tokens.
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityMetricsConfig {
    pub reset_interval: Duration, // Hard reset period (default: 1h)
}

impl Default for SecurityMetricsConfig {
    fn default() -> Self {
        Self {
            reset_interval: Duration::from_secs(3600),
        }
    }
}

impl SecurityMetricsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.reset_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "security metrics reset_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// SNAPSHOT: SecurityMetricsSnapshot - Point-in-Time Copy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityMetricsSnapshot {
    pub blocked_requests: u64,
    pub suspicious_ips: HashMap<String, u64>,
    pub threat_attempts: HashMap<String, u64>,
    pub last_reset: DateTime<Utc>,
}

impl SecurityMetricsSnapshot {
    /// The `n` most blocked identifiers, highest count first, ties by identifier.
    pub fn top_offenders(&self, n: usize) -> Vec<(String, u64)> {
        let mut offenders: Vec<(String, u64)> = self
            .suspicious_ips
            .iter()
            .map(|(identifier, count)| (identifier.clone(), *count))
            .collect();
        offenders.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        offenders.truncate(n);
        offenders
    }
}

#[derive(Debug)]
struct MetricsState {
    blocked_requests: u64,
    suspicious_ips: HashMap<String, u64>,
    threat_attempts: HashMap<String, u64>,
    last_reset: DateTime<Utc>,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            blocked_requests: 0,
            suspicious_ips: HashMap::new(),
            threat_attempts: HashMap::new(),
            last_reset: Utc::now(),
        }
    }

    fn reset(&mut self) {
        let discarded = self.blocked_requests;
        let identifiers = self.suspicious_ips.len();

        self.blocked_requests = 0;
        self.suspicious_ips.clear();
        self.threat_attempts.clear();
        self.last_reset = Utc::now();

        if discarded > 0 {
            info!(
                discarded_blocked_requests = discarded,
                discarded_identifiers = identifiers,
                "Security metrics reset"
            );
        } else {
            debug!("Security metrics reset");
        }
    }
}

// CORE SYSTEM: SecurityMetrics
pub struct SecurityMetrics {
    state: Arc<RwLock<MetricsState>>,
    reset_task: PeriodicTask,
}

impl SecurityMetrics {
    pub fn new(config: SecurityMetricsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(RwLock::new(MetricsState::new())),
            reset_task: PeriodicTask::new("security_metrics_reset", config.reset_interval),
        })
    }

    // LIFECYCLE: Start the periodic hard reset
    pub fn start(&self) -> bool {
        let state = self.state.clone();
        let started = self.reset_task.start(move || state.write().reset());
        if started {
            info!("Security metrics reset task started");
        }
        started
    }

    pub fn stop(&self) {
        if self.reset_task.stop() {
            info!("Security metrics reset task stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.reset_task.is_running()
    }

    pub fn record_blocked_request(&self, identifier: &str, reason: &str) {
        let mut state = self.state.write();
        state.blocked_requests += 1;
        *state
            .suspicious_ips
            .entry(identifier.to_string())
            .or_insert(0) += 1;
        *state.threat_attempts.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> SecurityMetricsSnapshot {
        let state = self.state.read();
        SecurityMetricsSnapshot {
            blocked_requests: state.blocked_requests,
            suspicious_ips: state.suspicious_ips.clone(),
            threat_attempts: state.threat_attempts.clone(),
            last_reset: state.last_reset,
        }
    }

    pub fn reset(&self) {
        self.state.write().reset();
    }
}

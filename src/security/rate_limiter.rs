// ARCHITECTURE: Rate Limiter - Per-Client Fixed-Window Token Buckets
//
// DESIGN PHILOSOPHY:
// Every caller identifier (remote address, API key, user id) owns one token bucket.
// 1. FULL REFILL: A bucket jumps back to capacity once its refill period has elapsed,
//    tokens never trickle in
// 2. FIRST USE COUNTS: The call that creates a bucket consumes one of its tokens
// 3. ISOLATION: Each bucket has its own lock, unrelated clients never contend
// 4. BOUNDED MEMORY: A background sweep evicts buckets idle for two windows
//
// LOCKING:
// - The identifier map sits behind a reader/writer lock: shared for lookups,
//   exclusive only to insert a new bucket or during the cleanup pass
// - The map lock is always released before a bucket lock is taken
// - Capacity is a single atomic that the adaptive controller may overwrite;
//   existing buckets keep the capacity they were created with

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use super::sweeper::PeriodicTask;
use crate::error::{Error, Result};

/// Refill period used by [`RefillPolicy::FixedMinute`].
pub const FIXED_REFILL_PERIOD: Duration = Duration::from_secs(60);

/// How long a bucket waits before it is topped back up to capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefillPolicy {
    /// Refill once a minute, whatever the configured window is.
    #[default]
    FixedMinute,
    /// Refill once per configured window.
    Window,
}

impl RefillPolicy {
    pub fn period(self, window: Duration) -> Duration {
        match self {
            RefillPolicy::FixedMinute => FIXED_REFILL_PERIOD,
            RefillPolicy::Window => window,
        }
    }
}

// CONFIGURATION: RateLimiterConfig - Base Limiter Parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub max_requests: u32,            // Bucket capacity for new clients (default: 100)
    pub window: Duration,             // Cleanup period, eviction after 2x (default: 60s)
    pub refill_policy: RefillPolicy,  // Bucket refill period (default: fixed minute)
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            refill_policy: RefillPolicy::FixedMinute,
        }
    }
}

impl RateLimiterConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            ..Default::default()
        }
    }

    pub fn with_refill_policy(mut self, refill_policy: RefillPolicy) -> Self {
        self.refill_policy = refill_policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(Error::InvalidConfig(
                "rate limiter max_requests must be positive".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(Error::InvalidConfig(
                "rate limiter window must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// TRACKING: TokenBucket - Fixed-Window Token Bucket
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: u32,
    capacity: u32,
    last_refill: Instant,
    refill_period: Duration,
}

impl TokenBucket {
    /// A bucket created by an admitted request, with that request already paid for.
    pub fn first_use(capacity: u32, refill_period: Duration) -> Self {
        Self {
            tokens: capacity.saturating_sub(1),
            capacity,
            last_refill: Instant::now(),
            refill_period,
        }
    }

    pub fn take_token(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_refill) >= self.refill_period {
            self.tokens = self.capacity;
            self.last_refill = now;
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }
}

// STATS: RateLimiterStats - Base Limiter Snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub active_buckets: usize,
    pub max_requests: u32,
    pub window_duration: Duration,
}

#[derive(Debug)]
struct BucketEntry {
    bucket: Mutex<TokenBucket>,
    // Nanoseconds since the limiter epoch; read by cleanup without the bucket lock.
    last_seen: AtomicU64,
}

struct LimiterState {
    buckets: RwLock<HashMap<String, Arc<BucketEntry>>>,
    max_requests: AtomicU32,
    window: Duration,
    refill_policy: RefillPolicy,
    epoch: Instant,
}

impl LimiterState {
    fn ticks_since_epoch(&self, now: Instant) -> u64 {
        u64::try_from(now.duration_since(self.epoch).as_nanos()).unwrap_or(u64::MAX)
    }

    fn cleanup_stale(&self) -> usize {
        let max_idle =
            u64::try_from(self.window.saturating_mul(2).as_nanos()).unwrap_or(u64::MAX);
        let now = self.ticks_since_epoch(Instant::now());

        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, entry| {
            now.saturating_sub(entry.last_seen.load(Ordering::Relaxed)) < max_idle
        });
        let removed = before - buckets.len();
        let active = buckets.len();
        drop(buckets);

        if removed > 0 {
            debug!(
                removed_buckets = removed,
                active_buckets = active,
                "Cleaned up stale rate limit buckets"
            );
        }
        removed
    }
}

// CORE SYSTEM: RateLimiter - Bucket Store
pub struct RateLimiter {
    state: Arc<LimiterState>,
    cleanup: PeriodicTask,
}

impl RateLimiter {
    // CONSTRUCTOR: Create rate limiter, rejecting nonsensical rates
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            state: Arc::new(LimiterState {
                buckets: RwLock::new(HashMap::new()),
                max_requests: AtomicU32::new(config.max_requests),
                window: config.window,
                refill_policy: config.refill_policy,
                epoch: Instant::now(),
            }),
            cleanup: PeriodicTask::new("rate_limiter_cleanup", config.window),
        })
    }

    // LIFECYCLE: Start the stale bucket sweep (one window period)
    pub fn start(&self) -> bool {
        let state = self.state.clone();
        let started = self.cleanup.start(move || {
            state.cleanup_stale();
        });

        if started {
            info!(
                max_requests = self.max_requests(),
                window_secs = self.state.window.as_secs_f64(),
                "Rate limiter cleanup started"
            );
        }
        started
    }

    // LIFECYCLE: Cancel the sweep; safe to call more than once
    pub fn stop(&self) {
        if self.cleanup.stop() {
            info!("Rate limiter cleanup stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.cleanup.is_running()
    }

    // CORE FUNCTION: Admission decision for one identifier
    pub fn allow(&self, identifier: &str) -> bool {
        let now = Instant::now();
        let existing = self.state.buckets.read().get(identifier).cloned();

        let entry = match existing {
            Some(entry) => entry,
            None => match self.create_bucket(identifier, now) {
                Some(raced) => raced,
                None => return true,
            },
        };

        let allowed = entry.bucket.lock().take_token();
        entry
            .last_seen
            .fetch_max(self.state.ticks_since_epoch(now), Ordering::Relaxed);

        if !allowed {
            debug!(identifier = %identifier, "Rate limit exceeded");
        }
        allowed
    }

    // Insert a first-use bucket, or hand back the one a concurrent caller created.
    fn create_bucket(&self, identifier: &str, now: Instant) -> Option<Arc<BucketEntry>> {
        let mut buckets = self.state.buckets.write();
        match buckets.entry(identifier.to_string()) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let capacity = self.max_requests();
                let refill_period = self.state.refill_policy.period(self.state.window);
                vacant.insert(Arc::new(BucketEntry {
                    bucket: Mutex::new(TokenBucket::first_use(capacity, refill_period)),
                    last_seen: AtomicU64::new(self.state.ticks_since_epoch(now)),
                }));
                drop(buckets);

                debug!(identifier = %identifier, capacity, "Created rate limit bucket");
                None
            }
        }
    }

    /// Evict buckets that have seen no traffic for two windows.
    pub fn cleanup_stale(&self) -> usize {
        self.state.cleanup_stale()
    }

    pub fn max_requests(&self) -> u32 {
        self.state.max_requests.load(Ordering::Acquire)
    }

    /// Overwrite the capacity handed to new buckets; returns the previous value.
    ///
    /// Only the owning adaptive controller should call this.
    pub fn set_max_requests(&self, max_requests: u32) -> u32 {
        self.state
            .max_requests
            .swap(max_requests.max(1), Ordering::AcqRel)
    }

    pub fn window(&self) -> Duration {
        self.state.window
    }

    pub fn refill_policy(&self) -> RefillPolicy {
        self.state.refill_policy
    }

    // API: Current (tokens, capacity) for a client, if it has a bucket
    pub fn client_status(&self, identifier: &str) -> Option<(u32, u32)> {
        let entry = self.state.buckets.read().get(identifier).cloned()?;
        let bucket = entry.bucket.lock();
        Some((bucket.tokens(), bucket.capacity()))
    }

    // API: Drop a client's bucket (admin function)
    pub fn reset_client(&self, identifier: &str) -> bool {
        let removed = self.state.buckets.write().remove(identifier).is_some();
        if removed {
            info!(identifier = %identifier, "Rate limit reset for client");
        }
        removed
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            active_buckets: self.state.buckets.read().len(),
            max_requests: self.max_requests(),
            window_duration: self.state.window,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.max_requests())
            .field("window", &self.state.window)
            .field("refill_policy", &self.state.refill_policy)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn limiter(max_requests: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(
            RateLimiterConfig::new(max_requests, window).with_refill_policy(RefillPolicy::Window),
        )
        .unwrap()
    }

    #[test]
    fn test_config_rejects_non_positive_values() {
        assert!(RateLimiter::new(RateLimiterConfig::new(0, Duration::from_secs(1))).is_err());
        assert!(RateLimiter::new(RateLimiterConfig::new(5, Duration::ZERO)).is_err());
        assert!(RateLimiter::new(RateLimiterConfig::default()).is_ok());
    }

    #[test]
    fn test_first_use_bucket_is_already_charged() {
        let bucket = TokenBucket::first_use(5, Duration::from_secs(1));
        assert_eq!(bucket.tokens(), 4);
        assert_eq!(bucket.capacity(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_refills_all_at_once() {
        let mut bucket = TokenBucket::first_use(3, Duration::from_secs(1));
        assert!(bucket.take_token());
        assert!(bucket.take_token());
        assert!(!bucket.take_token());

        advance(Duration::from_millis(999)).await;
        assert!(!bucket.take_token());

        advance(Duration::from_millis(1)).await;
        assert!(bucket.take_token());
        assert_eq!(bucket.tokens(), 2);
    }

    #[test]
    fn test_capacity_of_one() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert_eq!(limiter.client_status("a"), Some((0, 1)));
    }

    #[test]
    fn test_capacity_change_only_affects_new_buckets() {
        let limiter = limiter(5, Duration::from_secs(60));
        assert!(limiter.allow("old"));

        assert_eq!(limiter.set_max_requests(2), 5);
        assert!(limiter.allow("new"));

        assert_eq!(limiter.client_status("old"), Some((4, 5)));
        assert_eq!(limiter.client_status("new"), Some((1, 2)));
        assert_eq!(limiter.stats().max_requests, 2);
    }

    #[test]
    fn test_capacity_is_never_zero() {
        let limiter = limiter(5, Duration::from_secs(60));
        limiter.set_max_requests(0);
        assert_eq!(limiter.max_requests(), 1);
    }

    #[test]
    fn test_reset_client() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.reset_client("a"));
        assert!(!limiter.reset_client("a"));
        assert!(limiter.allow("a"));
    }

    #[tokio::test]
    async fn test_huge_window_does_not_overflow() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new(5, Duration::from_secs(u64::MAX))
                .with_refill_policy(RefillPolicy::Window),
        )
        .unwrap();
        assert!(limiter.start());
        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));

        assert_eq!(limiter.cleanup_stale(), 0);
        assert_eq!(limiter.client_status("a"), Some((3, 5)));
        limiter.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_keeps_recently_seen_buckets() {
        let limiter = limiter(5, Duration::from_secs(1));
        assert!(limiter.allow("idle"));
        assert!(limiter.allow("busy"));

        advance(Duration::from_millis(1500)).await;
        assert!(limiter.allow("busy"));

        advance(Duration::from_millis(600)).await;
        assert_eq!(limiter.cleanup_stale(), 1);
        assert_eq!(limiter.client_status("idle"), None);
        assert!(limiter.client_status("busy").is_some());
    }
}

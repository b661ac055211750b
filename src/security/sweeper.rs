// ARCHITECTURE: Periodic Sweeper - Cancellable Background Maintenance
//
// Both the bucket cleanup and the security metrics reset run on a fixed period
// for the lifetime of their owner. Each owner holds one PeriodicTask:
// - start() spawns the loop at most once
// - stop() cancels it, any number of times
// - dropping the owner cancels it as well
//
// The cancellation token is checked ahead of every tick, so a stopped sweeper
// never runs its body again.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::{runtime::Handle, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// Longest tick period; keeps interval deadlines representable.
const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub(crate) struct PeriodicTask {
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    pub(crate) fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period: period.min(MAX_PERIOD),
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    // LIFECYCLE: Spawn the loop on the current tokio runtime
    //
    // Returns false when the task is already running, was stopped, or there is
    // no runtime to spawn onto.
    pub(crate) fn start<F>(&self, mut tick: F) -> bool
    where
        F: FnMut() + Send + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.token.is_cancelled() {
            return false;
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(task = self.name, "No tokio runtime available, periodic task not started");
                return false;
            }
        };

        let token = self.token.clone();
        let period = self.period;
        let name = self.name;

        *handle = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(task = name, "Periodic task cancelled");
                        break;
                    }
                    _ = interval.tick() => tick(),
                }
            }
        }));

        true
    }

    // LIFECYCLE: Cancel the loop; returns true only on the first call
    pub(crate) fn stop(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        // The loop observes the token and exits on its own.
        self.handle.lock().take();
        true
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.token.is_cancelled() && self.handle.lock().is_some()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("test", Duration::from_secs(1));

        let counter = ticks.clone();
        assert!(task.start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(task.is_running());

        // Nothing runs before the first full period.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert!(task.stop());
        assert!(!task.is_running());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_one_shot() {
        let task = PeriodicTask::new("test", Duration::from_secs(60));
        assert!(task.start(|| {}));
        assert!(!task.start(|| {}));

        assert!(task.stop());
        assert!(!task.stop());
        assert!(!task.start(|| {}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_period_is_capped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("test", Duration::MAX);

        let counter = ticks.clone();
        assert!(task.start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(MAX_PERIOD + Duration::from_secs(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(task.stop());
    }

    #[test]
    fn test_start_without_runtime_is_refused() {
        let task = PeriodicTask::new("test", Duration::from_secs(1));
        assert!(!task.start(|| {}));
        assert!(!task.is_running());
    }
}

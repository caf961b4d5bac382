//! Bounded polling loops used to observe child servers from the outside.

mod probe;

pub use probe::{is_loading_payload, HealthProbe, HttpProbe, PROBE_PATH};

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Satisfied,
    TimedOut,
    Cancelled,
}

/// Runs a check every `interval` until it passes, `bound` elapses, or the
/// token is cancelled. A check that hangs is cut off at the deadline as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub interval: Duration,
    pub bound: Duration,
}

impl Poller {
    pub const fn new(interval: Duration, bound: Duration) -> Self {
        Self { interval, bound }
    }

    pub async fn run<F, Fut>(&self, cancel: &CancellationToken, mut check: F) -> PollOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + self.bound;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = sleep_until(deadline) => return PollOutcome::TimedOut,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                passed = check() => {
                    if passed {
                        return PollOutcome::Satisfied;
                    }
                }
                _ = sleep_until(deadline) => return PollOutcome::TimedOut,
            }
        }
    }
}

/// Timing for readiness and shutdown observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub readiness: Poller,
    pub shutdown: Poller,
    /// Extra wait after shutdown is confirmed (or timed out) before the port counts as free.
    pub settle: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            readiness: Poller::new(Duration::from_millis(500), Duration::from_secs(5 * 60)),
            shutdown: Poller::new(Duration::from_millis(200), Duration::from_secs(30)),
            settle: Duration::from_millis(500),
        }
    }
}

impl PollSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut settings = Self::default();
        settings.readiness.bound = config.readiness_timeout();
        settings.shutdown.bound = config.shutdown_timeout();
        settings
    }
}

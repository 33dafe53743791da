//! Retry pacing for background watchers

use rand::Rng;
use std::time::Duration;

/// Geometric backoff: 10ms, 100ms, 1s, 10s, then capped.
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Delay after the first failure
    pub initial: Duration,
    /// Growth factor per consecutive failure
    pub factor: u32,
    /// Upper bound on any single delay
    pub max: Duration,
    failures: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(10), 10, Duration::from_secs(10))
    }
}

impl Backoff {
    pub fn new(initial: Duration, factor: u32, max: Duration) -> Self {
        Self {
            initial,
            factor,
            max,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying
    pub fn failure(&mut self) -> Duration {
        let delay = self.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Back to the minimum delay
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn delay(&self, failures: u32) -> Duration {
        let initial_ms = self.initial.as_millis() as u64;
        let delay_ms = (self.factor as u64)
            .checked_pow(failures)
            .and_then(|growth| initial_ms.checked_mul(growth))
            .unwrap_or(u64::MAX);
        Duration::from_millis(delay_ms).min(self.max)
    }
}

/// Random delay in `[0, max)` to spread out reconnects
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

use std::cmp;
use std::time::Duration;

/// Linear reconnect backoff with a give-up ceiling.
///
/// Attempt `n` waits `base + n * step`. Once that delay reaches
/// `max_interval` the policy stops offering retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: Duration,
    step: Duration,
    max_interval: Duration,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, step: Duration, max_interval: Duration) -> Self {
        Self {
            base,
            step,
            max_interval,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` when the
    /// caller should give up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        let delay = self.base.saturating_add(self.step.saturating_mul(attempt));
        let delay = cmp::min(delay, self.max_interval);
        if delay < self.max_interval {
            Some(delay)
        } else {
            None
        }
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5 * 60),
        )
    }
}

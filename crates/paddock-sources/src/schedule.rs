//! Cancellable timers and reconnect backoff.

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless `token` fires first.
///
/// Returns `true` when the full duration elapsed, `false` on cancellation.
pub async fn sleep_or_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

/// Interval whose first tick fires immediately and which never bursts to
/// catch up after a slow iteration.
pub fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Wait for the next tick unless `token` fires first.
pub async fn tick_or_cancelled(interval: &mut Interval, token: &CancellationToken) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        _ = interval.tick() => true,
    }
}

/// Linear backoff: the n-th consecutive failure waits `n × step`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    step: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    /// Backoff allowing `max_attempts` retries.
    pub const fn new(step: Duration, max_attempts: u32) -> Self {
        Self {
            step,
            max_attempts,
            attempt: 0,
        }
    }

    /// Record a failure and return the delay before the next try, or `None`
    /// once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        Some(self.step.saturating_mul(self.attempt))
    }

    /// Forget earlier failures after a healthy connection.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failures recorded since the last reset.
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}

//! Backoff schedules for activity attempts

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::serde_duration::millis;

/// When, and how often, a failed activity runs again
///
/// Attempts are numbered from 1. The wait before attempt `n + 1` grows as
/// `initial_interval * backoff_coefficient^(n - 1)` and is capped at
/// `max_interval`. Jitter only shortens a wait, so the cap holds.
///
/// ```
/// use maas_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::unlimited(Duration::from_secs(1), Duration::from_secs(30));
/// assert_eq!(policy.next_retry(1), Some(Duration::from_secs(1)));
/// assert_eq!(policy.next_retry(3), Some(Duration::from_secs(4)));
/// assert_eq!(policy.next_retry(100), Some(Duration::from_secs(30)));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed, the first included; 0 for no limit
    pub max_attempts: u32,

    #[serde(with = "millis")]
    pub initial_interval: Duration,

    #[serde(with = "millis")]
    pub max_interval: Duration,

    pub backoff_coefficient: f64,

    /// Fraction of each wait that may be randomly shaved off, 0.0 to 1.0
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Five attempts, doubling from one second up to a minute
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Retry forever, doubling from `initial` up to `max`
    ///
    /// For calls that must eventually land, such as reports to a remote
    /// service that may be down for a while.
    pub fn unlimited(initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: 0,
            initial_interval: initial,
            max_interval: max,
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// The same wait between every attempt; 0 attempts polls forever
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_attempts == 0
    }

    /// Wait before the attempt after `attempt`, or `None` once attempts run out
    pub fn next_retry(&self, attempt: u32) -> Option<Duration> {
        if !self.is_unlimited() && attempt >= self.max_attempts {
            return None;
        }
        Some(self.jittered(self.backoff(attempt)))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let cap = self.max_interval;
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);

        Duration::try_from_secs_f64(secs).map_or(cap, |wait| wait.min(cap))
    }

    fn jittered(&self, wait: Duration) -> Duration {
        if self.jitter <= 0.0 || wait.is_zero() {
            return wait;
        }
        let shave = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        wait.mul_f64(1.0 - shave)
    }
}

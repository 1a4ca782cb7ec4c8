//! Retry policy and backoff math for failed generation attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy configuration.
///
/// `max_retries` counts **retries**, not attempts: an item with
/// `max_retries = 3` is attempted up to 4 times (the initial attempt plus
/// three retries) before it is dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt (0 = no retries)
    pub max_retries: u32,
    /// Base delay before a retried item becomes claimable again
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate the re-eligibility delay for a given retry number (1-indexed).
    ///
    /// The cap applies to every strategy, before jitter.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let raw_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => base_ms * 2_f64.powi((retry - 1).min(62) as i32),
            BackoffStrategy::Linear => base_ms * f64::from(retry),
        };
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);

        // Spread retries within +-jitter of the capped delay. The phase is a
        // low-discrepancy function of the retry number, so delays stay stable
        // across runs without a shared RNG.
        let phase = (f64::from(retry) * 0.618_034).fract();
        let jittered_ms = capped_ms * (1.0 + self.jitter * (2.0 * phase - 1.0));

        Duration::from_millis(jittered_ms.max(0.0) as u64)
    }

    /// Check whether an item with the given retry count may be retried again.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

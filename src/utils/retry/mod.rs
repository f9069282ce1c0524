//! Reconnect backoff with exponential growth, cap, and jitter.
//!
//! The policy is a pure `previous delay -> next delay` function shared by the
//! broker adapter and the SSE client. The retry budget (`max_retries`) lives
//! on the component configs, not here.

use std::sync::Arc;
use std::time::Duration;

/// Pluggable backoff function: maps the previous delay to the next one.
/// A zero previous delay means the first retry.
pub type RetryFunc = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Configuration for the default backoff shape.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay for the first retry (before jitter).
    pub base_delay: Duration,
    /// Maximum delay; outputs never exceed it.
    pub max_delay: Duration,
    /// Jitter factor: up to `jitter * delay` is added on top of the
    /// exponential value. Set to 0.0 for no jitter.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Compute the delay following `prev`.
    ///
    /// Doubles the previous delay (starting from `base_delay`), adds bounded
    /// jitter, and caps at `max_delay`. Outputs are non-decreasing up to the
    /// cap: the un-jittered double of any output is at least that output.
    pub fn next_delay(&self, prev: Duration) -> Duration {
        let doubled = if prev.is_zero() {
            self.base_delay
        } else {
            prev.saturating_mul(2)
        };

        let jittered = if self.jitter > 0.0 {
            // Deterministic jitter from the clock, same trick as hashing a
            // timestamp: avoids a rand dependency while still spreading
            // reconnect storms.
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0) as u64;
            let hash = nanos.wrapping_mul(31).wrapping_add(doubled.as_millis() as u64 * 17);
            let fraction = (hash % 1000) as f64 / 1000.0;
            let extra = doubled.as_millis() as f64 * self.jitter * fraction;
            doubled + Duration::from_millis(extra as u64)
        } else {
            doubled
        };

        jittered.min(self.max_delay)
    }

    /// The policy as a pluggable [`RetryFunc`].
    pub fn retry_func(&self) -> RetryFunc {
        let config = self.clone();
        Arc::new(move |prev| config.next_delay(prev))
    }
}

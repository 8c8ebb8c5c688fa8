use rand::Rng;
use std::time::Duration;

/// Backoff and retryability policy for transient network failures.
///
/// Pure and stateless: `delay` is a function of the attempt index, so callers
/// drive it with their own counters and it unit-tests without clocks.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add uniform random jitter in [0, 0.5s) to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(6),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Delay before retrying after the given zero-based attempt:
    /// `min(max_delay, base_delay * 2^attempt + jitter)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
        let jitter = if self.jitter {
            rand::rng().random_range(0.0..0.5)
        } else {
            0.0
        };
        Duration::from_secs_f64((exponential + jitter).min(self.max_delay.as_secs_f64()))
    }

    /// 429 and every 5xx are worth retrying; everything else is not.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        status == 429 || (500..=599).contains(&status)
    }

    /// Transport-level failures worth retrying: timeouts, connect failures
    /// and connections lost mid-request. Builder, status and decode errors
    /// are deterministic and never retried.
    pub fn is_retryable(&self, error: &reqwest::Error) -> bool {
        if error.is_builder() || error.is_status() || error.is_decode() {
            return false;
        }
        error.is_timeout() || error.is_connect() || error.is_body() || error.is_request()
    }
}

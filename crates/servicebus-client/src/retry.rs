//! # Retry Policy Module
//!
//! Exponential backoff for transient transport failures.
//!
//! Only errors for which [`TransportError::is_transient`] holds are retried.
//! Everything else is returned to the caller on the first failure.

use crate::config::RetryConfig;
use crate::transport::TransportError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Retry policy configuration for exponential backoff
///
/// # Examples
///
/// ```rust
/// use servicebus_client::retry::RetryPolicy;
/// use std::time::Duration;
///
/// // Default policy: 3 retries, 100ms initial, 5s max, 2.0x multiplier
/// let policy = RetryPolicy::default();
///
/// // Custom policy
/// let policy = RetryPolicy::new(5, Duration::from_millis(500), Duration::from_secs(5), 1.5);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_attempts: u32,

    /// Initial delay before first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub use_jitter: bool,

    /// Jitter range as a fraction of the delay (0.25 = ±25%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create a new retry policy with jitter enabled
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }

    /// Build a policy from client configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            use_jitter: config.use_jitter,
            jitter_percent: 0.25,
        }
    }

    /// Disable jitter
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Set custom jitter percentage (0.0 to 1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a specific retry attempt (0-based).
    ///
    /// `delay = initial * multiplier^attempt`, capped at `max_delay`, then
    /// jittered if enabled.
    ///
    /// ```rust
    /// use servicebus_client::retry::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default().without_jitter();
    /// assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
    /// assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
    /// ```
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let capped_delay_secs = base_delay_secs.min(self.max_delay.as_secs_f64());

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        Duration::from_secs_f64(final_delay_secs)
    }

    /// Check if another retry is allowed for this attempt number (0-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Total number of attempts including the first one
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }

    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        (delay_secs + jitter).max(0.0)
    }
}

/// Run `attempt` until it succeeds, fails permanently or retries run out.
///
/// When `deadline` is given, no retry is started whose backoff would end past
/// it; the last error is returned instead.
pub(crate) async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    deadline: Option<Instant>,
    mut attempt: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut retry = 0;

    loop {
        let error = match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !error.is_transient() || !policy.should_retry(retry) {
            return Err(error);
        }

        let delay = policy.calculate_delay(retry);
        if deadline.is_some_and(|d| Instant::now() + delay >= d) {
            return Err(error);
        }

        warn!(
            operation = operation,
            attempt = retry + 1,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, retrying"
        );

        tokio::time::sleep(delay).await;
        retry += 1;
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

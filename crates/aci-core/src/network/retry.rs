//! Bounded retry with an optional pause.
//!
//! The operation receives the zero-based attempt index, so callers can force a
//! fresh connection on every attempt after the first.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NetworkConfig;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// Pause before each retry.
    pub base_delay: Duration,
    /// Whether to spread the pause randomly over 0.5x..1.5x.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::reconnect_once()
    }
}

impl RetryConfig {
    /// One attempt plus one forced-reconnect retry, without delay.
    pub fn reconnect_once() -> Self {
        Self {
            max_attempts: NetworkConfig::RECONNECT_ATTEMPTS,
            base_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// The pause before the next attempt.
    pub fn calculate_delay(&self) -> Duration {
        let secs = self.base_delay.as_secs_f64();
        if self.jitter && secs > 0.0 {
            // Scale by 0.5..1.5 so the average delay is unchanged
            let mut rng = rand::rng();
            return Duration::from_secs_f64(secs * rng.random_range(0.5..1.5));
        }
        self.base_delay
    }
}

/// Statistics about a retry operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total delay accumulated.
    pub total_delay: Duration,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// Last error message if failed.
    pub last_error: Option<String>,
}

/// Retry an async operation.
///
/// `operation` is called with the attempt index. Errors rejected by
/// `should_retry` are returned immediately.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        stats.attempts = attempt + 1;

        let err = match operation(attempt).await {
            Ok(value) => {
                stats.success = true;
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };
        stats.last_error = Some(err.to_string());

        if !should_retry(&err) {
            debug!("Error is not retryable: {}", err);
            return (Err(err), stats);
        }

        if attempt + 1 >= max_attempts {
            warn!(
                "All {} attempts exhausted. Last error: {}",
                max_attempts, err
            );
            return (Err(err), stats);
        }

        let delay = config.calculate_delay();
        stats.total_delay += delay;
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt + 1,
            max_attempts,
            err,
            delay
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

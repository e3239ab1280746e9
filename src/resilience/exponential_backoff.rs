use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

use crate::config::duration_ms;
use crate::error::{ApiError, Result};

/// Configuration for caller-side retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_attempts: usize,
    #[serde(rename = "initialBackoffMs", with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(rename = "maxBackoffMs", with = "duration_ms")]
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

/// Exponential backoff schedule.
///
/// The ceiling starts at `initial_backoff` and is multiplied after every
/// step, saturating at `max_backoff`. With jitter a step waits a random
/// share of the ceiling, never less than half of it.
#[derive(Debug)]
pub struct ExponentialBackoff {
    current_attempt: usize,
    ceiling_ms: u64,
    config: RetryConfig,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            current_attempt: 0,
            ceiling_ms: capped_millis(config.initial_backoff, &config),
            config,
        }
    }

    /// Get the next backoff duration, or None if max attempts reached
    pub fn next_backoff(&mut self) -> Option<Duration> {
        self.step(Duration::ZERO)
    }

    /// Next delay for a failed attempt, never shorter than the error's own wait hint
    pub fn next_delay_for(&mut self, err: &ApiError) -> Option<Duration> {
        self.step(err.retry_after().unwrap_or_default())
    }

    fn step(&mut self, floor: Duration) -> Option<Duration> {
        self.current_attempt += 1;
        if self.current_attempt > self.config.max_attempts {
            return None;
        }

        let delay_ms = if self.config.use_jitter {
            rand::random_range(self.ceiling_ms / 2..=self.ceiling_ms)
        } else {
            self.ceiling_ms
        };

        let grown = (self.ceiling_ms as f64 * self.config.backoff_multiplier).round();
        self.ceiling_ms = capped_millis(Duration::from_millis(grown as u64), &self.config);

        Some(Duration::from_millis(delay_ms).max(floor))
    }

    pub fn attempts(&self) -> usize {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
        self.ceiling_ms = capped_millis(self.config.initial_backoff, &self.config);
    }
}

fn capped_millis(delay: Duration, config: &RetryConfig) -> u64 {
    delay.min(config.max_backoff).as_millis() as u64
}

/// Runs `operation`, retrying retryable failures with exponential backoff.
///
/// Errors for which [`ApiError::is_retryable`] is false, such as an open
/// circuit, are returned immediately.
pub async fn retry_with_backoff<T, F, Fut>(config: RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = ExponentialBackoff::new(config);

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => match backoff.next_delay_for(&err) {
                Some(delay) => {
                    debug!(
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after backoff"
                    );
                    time::sleep(delay).await;
                }
                None => {
                    warn!(attempts = backoff.attempts() - 1, error = %err, "Retries exhausted");
                    return Err(err);
                }
            },
        }
    }
}

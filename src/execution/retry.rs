//! Bounded retry with exponential backoff for trade submission
//!
//! Transient failures (and attempts that time out) are retried up to
//! `max_attempts`; a fatal failure stops immediately.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::ExecutionConfig;
use crate::error::{Error, Result};

/// Result of one attempt, classified for the retry loop
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    Transient(Error),
    Fatal(Error),
}

impl<T> From<Result<T>> for Outcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(e) if e.is_retryable() => Outcome::Transient(e),
            Err(e) => Outcome::Fatal(e),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Bound on a single attempt
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: 2.0,
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_backoff)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `op` until it succeeds, fails fatally, or attempts run out
///
/// Fatal errors are returned as-is; exhausting the attempts yields
/// `RetriesExhausted` carrying the last transient error.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = match tokio::time::timeout(policy.attempt_timeout, op(attempt)).await {
            Ok(result) => Outcome::from(result),
            Err(_) => Outcome::Transient(Error::Timeout(policy.attempt_timeout.as_millis() as u64)),
        };

        let error = match outcome {
            Outcome::Ok(value) => return Ok(value),
            Outcome::Fatal(e) => return Err(e),
            Outcome::Transient(e) => e,
        };

        if attempt >= policy.max_attempts {
            return Err(Error::RetriesExhausted {
                attempts: attempt,
                last_error: error.to_string(),
            });
        }

        let delay = backoff.next_backoff().unwrap_or(policy.max_backoff);
        warn!(
            "{} attempt {}/{} failed: {} (retrying in {:?})",
            label, attempt, policy.max_attempts, error, delay
        );
        tokio::time::sleep(delay).await;
    }
}

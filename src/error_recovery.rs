//! Bounded retry for transient failures.
//!
//! Opening an instrument can fail transiently (driver still releasing the
//! port, bus briefly locked by another session). Those attempts are retried
//! according to a `RetryPolicy`; the number of attempts is always finite.

use std::thread::sleep;
use std::time::Duration;

use tracing::warn;

use crate::config::DiscoveryConfig;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl From<&DiscoveryConfig> for RetryPolicy {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            max_attempts: config.max_open_attempts.max(1),
            backoff_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

/// Outcome of the last attempt when every attempt failed.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts made
    pub attempts: u32,
    /// Error of the final attempt
    pub last_error: E,
}

impl RetryPolicy {
    /// Run `operation` until it succeeds, `retryable` rejects its error, or
    /// the attempt budget is spent.
    ///
    /// The closure receives the 1-based attempt number.
    pub fn run<T, E, F, R>(&self, what: &str, mut operation: F, retryable: R) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && retryable(&e) => {
                    warn!(
                        target_resource = what,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    sleep(self.backoff_delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Exhausted {
                        attempts: attempt,
                        last_error: e,
                    })
                }
            }
        }
    }
}

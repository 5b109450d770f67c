//! Retry policy for resource downloads.

use crate::constants::{
    DEFAULT_DOWNLOAD_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MULTIPLIER,
    MAX_RETRY_DELAY,
};
use crate::error::{Error, Result};
use crate::storage::remove_path;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Bounded retry with exponential backoff.
///
/// Each attempt is independent: with `cleanup_between_attempts` set, the
/// partial output of a failed attempt is removed before the next one and
/// after the last one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Remove partial output after each failed attempt.
    pub cleanup_between_attempts: bool,
    /// Delay before the second attempt.
    pub base_delay_ms: u64,
    /// Growth factor for later delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_DOWNLOAD_ATTEMPTS,
            cleanup_between_attempts: true,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` attempts and no delay between them.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            ..Self::default()
        }
    }

    /// Delay after `attempts` failed attempts (1-indexed).
    ///
    /// delay = base_delay * multiplier^(attempts - 1), capped at
    /// [`MAX_RETRY_DELAY`].
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = Duration::from_millis(self.base_delay_ms).as_secs_f64();
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs.max(0.0))
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }

    /// Runs `attempt` until it succeeds or the attempts are exhausted.
    ///
    /// Validation errors (hash mismatch, bad input) end the loop at once.
    /// Exhaustion is reported as [`Error::CommunicationRetrieval`].
    pub async fn retry<T, F, Fut>(&self, resource: &str, partial: &Path, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = String::new();

        for n in 1..=max_attempts {
            match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_validation() => {
                    self.cleanup(partial);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Attempt {}/{} to retrieve {} failed: {}",
                        n, max_attempts, resource, e
                    );
                    last_error = e.to_string();
                    self.cleanup(partial);
                    if n < max_attempts {
                        tokio::time::sleep(self.next_delay(n)).await;
                    }
                }
            }
        }

        Err(Error::CommunicationRetrieval {
            resource: resource.to_string(),
            attempts: max_attempts,
            reason: last_error,
        })
    }

    fn cleanup(&self, partial: &Path) {
        if self.cleanup_between_attempts
            && let Err(e) = remove_path(partial)
        {
            warn!("Failed to remove partial file {}: {}", partial.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_increases() {
        let policy = RetryPolicy {
            base_delay_ms: 2000,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_overflowing_backoff_is_capped() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            multiplier: 1.0e300,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(3), MAX_RETRY_DELAY);
        assert_eq!(policy.next_delay(u32::MAX), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_nan_multiplier_does_not_wait() {
        let policy = RetryPolicy {
            multiplier: f64::NAN,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.next_delay(2), Duration::ZERO);
    }

    #[test]
    fn test_immediate_policy_has_no_delay() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.next_delay(2), Duration::ZERO);
    }
}

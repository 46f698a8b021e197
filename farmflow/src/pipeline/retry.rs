//! Retry utilities with exponential backoff and jitter.
//!
//! Wraps a single dependency call so that transient failures are retried
//! with growing delays while fatal failures abort immediately. Back-off waits
//! race the batch [`CancellationToken`] so an operator cancel never has to
//! sit out a sleep.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::cancellation::CancellationToken;
use crate::errors::{ServiceError, StageError};

/// Message fragments that mark an error as transient.
pub const TRANSIENT_INDICATORS: [&str; 7] = [
    "timeout",
    "temporary",
    "connection refused",
    "connection reset",
    "broken pipe",
    "service unavailable",
    "too many requests",
];

const JITTER_RATIO: f64 = 0.1;

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each retry.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Whether to spread delays by ±10%.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffConfig {
    /// Creates a new retry config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay_ms(mut self, delay: u64) -> Self {
        self.initial_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff factor.
    #[must_use]
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based),
    /// without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Delay before the next retry, with jitter applied when enabled.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO));
        base.mul_f64(spread)
            .min(Duration::from_millis(self.max_delay_ms))
    }
}

/// An error that can say whether it is worth retrying.
///
/// The default is "not retryable"; the message is still checked for
/// transient indicators by [`is_retryable_error`].
pub trait RetryableError: fmt::Display {
    /// Explicit retryable marker.
    fn is_retryable(&self) -> bool {
        false
    }
}

impl RetryableError for ServiceError {
    fn is_retryable(&self) -> bool {
        ServiceError::is_retryable(self)
    }
}

impl RetryableError for StageError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl RetryableError for String {}

impl RetryableError for &str {}

/// Returns true if the error carries a retryable marker or its message
/// contains a transient indicator.
#[must_use]
pub fn is_retryable_error<E: RetryableError + ?Sized>(err: &E) -> bool {
    err.is_retryable() || has_transient_indicator(&err.to_string())
}

fn has_transient_indicator(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_INDICATORS
        .iter()
        .any(|indicator| lower.contains(indicator))
}

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The error was classified as fatal; no further attempts were made.
    #[error("fatal error on attempt {attempts}: {last_error}")]
    Fatal {
        /// Attempts made.
        attempts: u32,
        /// The fatal error.
        last_error: E,
    },

    /// Every attempt failed with a transient error.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The last failure.
        last_error: E,
    },

    /// Cancelled while waiting to retry.
    #[error("cancelled after {attempts} attempts: {reason}")]
    Cancelled {
        /// Attempts made.
        attempts: u32,
        /// Cancellation reason.
        reason: String,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Returns the last underlying error, if the operation produced one.
    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::Fatal { last_error, .. } | Self::Exhausted { last_error, .. } => {
                Some(last_error)
            }
            Self::Cancelled { .. } => None,
        }
    }
}

/// Executes an operation with retry logic.
///
/// Runs `operation` up to `config.max_attempts` times. Fatal errors return
/// [`RetryError::Fatal`] at once; transient errors are retried after a
/// back-off delay until attempts run out. Cancellation during a back-off wait
/// returns [`RetryError::Cancelled`] with the token's reason.
pub async fn retry_with_backoff<T, E, F, Fut>(
    token: &CancellationToken,
    config: &BackoffConfig,
    key: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_retryable_error(&err) {
            tracing::debug!(key, attempt, error = %err, "fatal error, not retrying");
            return Err(RetryError::Fatal {
                attempts: attempt,
                last_error: err,
            });
        }

        if attempt >= max_attempts {
            tracing::debug!(key, attempt, error = %err, "retries exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: err,
            });
        }

        let delay = config.delay_for(attempt);
        tracing::debug!(
            key,
            attempt,
            delay_ms = super::metrics::duration_ms(delay),
            error = %err,
            "Retrying after error"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            reason = token.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt, reason });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> BackoffConfig {
        BackoffConfig::new()
            .with_initial_delay_ms(1)
            .with_jitter(false)
    }

    #[test]
    fn test_backoff_config_default() {
        let config = BackoffConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay_ms, 200);
        assert_eq!(config.max_delay_ms, 5000);
        assert!((config.backoff_factor - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter);
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let config = BackoffConfig::new()
            .with_initial_delay_ms(100)
            .with_max_delay_ms(350)
            .with_jitter(false);

        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(350));
        assert_eq!(config.delay_for(30), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let config = BackoffConfig::new().with_initial_delay_ms(1000);
        for _ in 0..50 {
            let millis = config.delay_for(1).as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[test]
    fn test_classification() {
        assert!(is_retryable_error(&"upstream timeout while creating account"));
        assert!(is_retryable_error(&"Connection Reset by peer".to_string()));
        assert!(is_retryable_error(&ServiceError::rejected(503, "busy")));
        assert!(!is_retryable_error(&"username already taken"));
        assert!(!is_retryable_error(&ServiceError::rejected(409, "conflict")));
        assert!(!is_retryable_error(&StageError::validation("bad phone")));
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let token = CancellationToken::new();
        let mut calls = 0;

        let result: Result<i32, RetryError<&str>> =
            retry_with_backoff(&token, &fast(), "test", || {
                calls += 1;
                async { Ok(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<i32, RetryError<String>> =
            retry_with_backoff(&token, &fast(), "test", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("temporary failure {n}"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_immediately() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), RetryError<String>> =
            retry_with_backoff(&token, &fast(), "test", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("invalid credentials".to_string())
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Fatal { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_failure() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), RetryError<String>> =
            retry_with_backoff(&token, &fast(), "test", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("timeout on call {n}"))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert!(err.to_string().contains("timeout on call 3"));
        assert_eq!(err.into_last_error().as_deref(), Some("timeout on call 3"));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff_wait() {
        let token = Arc::new(CancellationToken::new());
        let config = BackoffConfig::new()
            .with_initial_delay_ms(60_000)
            .with_max_delay_ms(60_000)
            .with_jitter(false);

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel("operator cancelled batch");
            })
        };

        let started = std::time::Instant::now();
        let result: Result<(), RetryError<&str>> =
            retry_with_backoff(&token, &config, "test", || async { Err("service unavailable") })
                .await;
        canceller.await.unwrap();

        match result {
            Err(RetryError::Cancelled { attempts, reason }) => {
                assert_eq!(attempts, 1);
                assert_eq!(reason, "operator cancelled batch");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

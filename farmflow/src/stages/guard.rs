//! Breaker-and-retry wrapper around a single dependency call.

use std::future::Future;
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::errors::{ErrorCode, ServiceError, StageError};
use crate::pipeline::{
    retry_with_backoff, BackoffConfig, CallOutcome, CircuitBreaker, CircuitBreakerConfig,
    CircuitError, RetryError,
};

/// One circuit breaker per external dependency, shared by every worker.
#[derive(Debug, Clone)]
pub struct DependencyBreakers {
    /// Identity service breaker.
    pub accounts: Arc<CircuitBreaker>,
    /// Linkage service breaker.
    pub linkage: Arc<CircuitBreaker>,
    /// Farmer registry breaker.
    pub registry: Arc<CircuitBreaker>,
}

impl DependencyBreakers {
    /// Creates closed breakers with the same thresholds.
    #[must_use]
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            accounts: Arc::new(CircuitBreaker::new("accounts", config.clone())),
            linkage: Arc::new(CircuitBreaker::new("linkage", config.clone())),
            registry: Arc::new(CircuitBreaker::new("registry", config.clone())),
        }
    }
}

impl Default for DependencyBreakers {
    fn default() -> Self {
        Self::new(&CircuitBreakerConfig::default())
    }
}

/// Protects calls to one dependency.
///
/// Retries run inside the breaker's window: the breaker sees one call per
/// retry loop and only counts it as a failure when every attempt failed
/// transiently. A rejection means the dependency answered. Cancellation
/// leaves the breaker as it was.
#[derive(Debug, Clone)]
pub struct DependencyGuard {
    breaker: Arc<CircuitBreaker>,
    retry: BackoffConfig,
}

impl DependencyGuard {
    /// Creates a guard.
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, retry: BackoffConfig) -> Self {
        Self { breaker, retry }
    }

    /// Returns the breaker.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Returns the retry config.
    #[must_use]
    pub fn retry_config(&self) -> &BackoffConfig {
        &self.retry
    }

    /// Calls the dependency, mapping every way of giving up to a [`StageError`].
    pub async fn call<T, F, Fut>(
        &self,
        token: &CancellationToken,
        operation: &str,
        call: F,
    ) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let result = self
            .breaker
            .call_filtered(
                || retry_with_backoff(token, &self.retry, operation, call),
                |err| match err {
                    RetryError::Exhausted { .. } => CallOutcome::Failure,
                    RetryError::Fatal { .. } => CallOutcome::Success,
                    RetryError::Cancelled { .. } => CallOutcome::Neutral,
                },
            )
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(CircuitError::Open { name }) => Err(StageError::new(
                ErrorCode::CircuitOpen,
                format!("{operation}: circuit '{name}' is open"),
                true,
            )),
            Err(CircuitError::Inner(RetryError::Fatal { last_error, .. })) => {
                Err(StageError::from(last_error))
            }
            Err(CircuitError::Inner(RetryError::Exhausted {
                attempts,
                last_error,
            })) => {
                let mut err = StageError::from(last_error);
                err.message = format!("{operation} failed after {attempts} attempts: {}", err.message);
                err.retryable = true;
                Err(err)
            }
            Err(CircuitError::Inner(RetryError::Cancelled { reason, .. })) => {
                Err(StageError::cancelled(reason))
            }
        }
    }
}

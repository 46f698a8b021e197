//! Circuit breaker protecting calls to one external dependency.
//!
//! ```text
//! Closed -> Open:      consecutive failures reach max_failures
//! Open -> HalfOpen:    reset_timeout elapsed since the last failure
//! HalfOpen -> Closed:  the single trial call succeeds
//! HalfOpen -> Open:    the trial call fails
//! ```
//!
//! A call whose future is dropped before it settles counts as a failure.
//! One breaker is shared by every worker calling the same dependency.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use super::metrics::duration_ms;

fn default_max_failures() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Cool-down before a trial call is let through, in milliseconds.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a config with the given thresholds.
    #[must_use]
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures,
            reset_timeout_ms: duration_ms(reset_timeout),
        }
    }

    /// Returns the reset timeout.
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// One trial call is allowed.
    HalfOpen,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The call was rejected without reaching the dependency.
    #[error("circuit '{name}' is open")]
    Open {
        /// Breaker name.
        name: String,
    },

    /// The call ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// How a settled call affects the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The dependency answered; closes the circuit and resets the count.
    Success,
    /// The dependency is unhealthy; moves the breaker toward open.
    Failure,
    /// Says nothing about the dependency; only frees the trial slot.
    Neutral,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// A consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a new breaker in the closed state.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Returns the breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns the current consecutive failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Asks for permission to make a call.
    ///
    /// In the open state this moves to half-open once the reset timeout has
    /// elapsed and grants the single trial slot.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.config.reset_timeout());
                if cooled_down {
                    info!(breaker = %self.name, "circuit half-open, allowing trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "circuit closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;
        match inner.state {
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "trial call failed, circuit re-opened");
                inner.state = CircuitState::Open;
            }
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.config.max_failures.max(1) {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Frees a granted call slot without changing state or counters.
    pub fn release(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    /// Runs `operation` through the breaker, counting every error as a failure.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(operation, |_| CallOutcome::Failure).await
    }

    /// Runs `operation` through the breaker, letting `classify` decide what
    /// each error means for the dependency's health.
    pub async fn call_filtered<T, E, F, Fut, C>(
        &self,
        operation: F,
        classify: C,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> CallOutcome,
    {
        if !self.try_acquire() {
            return Err(CircuitError::Open {
                name: self.name.clone(),
            });
        }

        let mut guard = CallGuard {
            breaker: self,
            settled: false,
        };
        let result = operation().await;
        guard.settled = true;

        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(err) => classify(err),
        };
        match outcome {
            CallOutcome::Success => self.record_success(),
            CallOutcome::Failure => self.record_failure(),
            CallOutcome::Neutral => self.release(),
        }
        result.map_err(CircuitError::Inner)
    }
}

/// Counts a call as failed when its future is dropped before it settles,
/// which is how an outer deadline ends a hanging call.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(breaker = %self.breaker.name, "call abandoned before it settled");
            self.breaker.record_failure();
        }
    }
}

//! Pipeline execution.
//!
//! This module provides:
//! - The sequential executor with per-stage timeouts
//! - Per-stage metrics shared by all workers
//! - Retry with exponential backoff and the circuit breaker that guard
//!   dependency calls

mod circuit_breaker;
mod executor;
mod metrics;
mod retry;

pub use circuit_breaker::{
    CallOutcome, CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState,
};
pub use executor::{Pipeline, PipelineOutcome};
pub use metrics::{duration_ms, PipelineMetrics, StageMetrics};
pub use retry::{
    is_retryable_error, retry_with_backoff, BackoffConfig, RetryError, RetryableError,
    TRANSIENT_INDICATORS,
};

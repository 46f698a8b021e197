//! Configuration for the onboarding pipeline and batch coordinator.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::context::StageKind;
use crate::errors::ConfigError;
use crate::pipeline::{BackoffConfig, CircuitBreakerConfig};

/// Top-level onboarding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnboardingConfig {
    /// Records processed concurrently per batch.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Retry ceiling for operator-triggered record retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Completed details buffered before a store flush.
    #[serde(default = "default_detail_flush_size")]
    pub detail_flush_size: usize,
    /// Backoff applied to every dependency call.
    #[serde(default)]
    pub retry: BackoffConfig,
    /// Breaker settings shared by all dependencies.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-stage timeouts.
    #[serde(default)]
    pub stage_timeouts: StageTimeouts,
}

fn default_worker_count() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_detail_flush_size() -> usize {
    25
}

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_retries: default_max_retries(),
            detail_flush_size: default_detail_flush_size(),
            retry: BackoffConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            stage_timeouts: StageTimeouts::default(),
        }
    }
}

impl OnboardingConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker count. Zero is raised to one.
    #[must_use]
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers.max(1);
        self
    }

    /// Sets the record retry ceiling.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the detail flush size.
    #[must_use]
    pub fn with_detail_flush_size(mut self, size: usize) -> Self {
        self.detail_flush_size = size.max(1);
        self
    }

    /// Sets the dependency backoff.
    #[must_use]
    pub fn with_retry(mut self, retry: BackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the breaker settings.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    /// Sets the stage timeouts.
    #[must_use]
    pub fn with_stage_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.stage_timeouts = timeouts;
        self
    }

    /// Effective worker count, never below one.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.worker_count.max(1)
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`Self::from_json_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(invalid("worker_count", "must be at least 1"));
        }
        if self.detail_flush_size == 0 {
            return Err(invalid("detail_flush_size", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            return Err(invalid(
                "retry.backoff_factor",
                format!("must be >= 1.0, got {}", self.retry.backoff_factor),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.initial_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        if self.circuit_breaker.max_failures == 0 {
            return Err(invalid("circuit_breaker.max_failures", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Per-stage timeouts in milliseconds. Zero disables the timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimeouts {
    /// Validation is local and runs without a deadline.
    #[serde(default)]
    pub validation_ms: u64,
    /// Duplicate lookup.
    #[serde(default = "default_lookup_timeout")]
    pub deduplication_ms: u64,
    /// Account lookup and creation.
    #[serde(default = "default_provisioning_timeout")]
    pub identity_creation_ms: u64,
    /// Farmer creation or update.
    #[serde(default = "default_provisioning_timeout")]
    pub domain_registration_ms: u64,
    /// Organization linkage.
    #[serde(default = "default_linkage_timeout")]
    pub organization_linkage_ms: u64,
    /// Agent assignment.
    #[serde(default = "default_linkage_timeout")]
    pub agent_assignment_ms: u64,
}

fn default_lookup_timeout() -> u64 {
    10_000
}

fn default_provisioning_timeout() -> u64 {
    30_000
}

fn default_linkage_timeout() -> u64 {
    15_000
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            validation_ms: 0,
            deduplication_ms: default_lookup_timeout(),
            identity_creation_ms: default_provisioning_timeout(),
            domain_registration_ms: default_provisioning_timeout(),
            organization_linkage_ms: default_linkage_timeout(),
            agent_assignment_ms: default_linkage_timeout(),
        }
    }
}

impl StageTimeouts {
    /// Timeouts disabled for every stage.
    #[must_use]
    pub fn none() -> Self {
        Self {
            validation_ms: 0,
            deduplication_ms: 0,
            identity_creation_ms: 0,
            domain_registration_ms: 0,
            organization_linkage_ms: 0,
            agent_assignment_ms: 0,
        }
    }

    /// Timeout for a stage; [`Duration::ZERO`] means none.
    #[must_use]
    pub fn timeout_for(&self, kind: StageKind) -> Duration {
        let ms = match kind {
            StageKind::Validation => self.validation_ms,
            StageKind::Deduplication => self.deduplication_ms,
            StageKind::IdentityCreation => self.identity_creation_ms,
            StageKind::DomainRegistration => self.domain_registration_ms,
            StageKind::OrganizationLinkage => self.organization_linkage_ms,
            StageKind::AgentAssignment => self.agent_assignment_ms,
        };
        Duration::from_millis(ms)
    }
}

//! Per-record processing context.
//!
//! This module provides:
//! - The `ProcessingContext` owned by one worker for one record
//! - Typed result slots for each of the six onboarding stages

#[cfg(test)]
mod context_tests;
mod processing;
mod results;

pub use processing::{ProcessingContext, ResumeState};
pub use results::{
    AgentAssignmentResult, DedupAction, DeduplicationResult, IdentityResult, LinkageResult,
    RegistrationResult, StageKind, StageResults, ValidationResult,
};

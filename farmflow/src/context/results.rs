//! Typed results recorded by each onboarding stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::StageStatus;

/// The six onboarding stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Required fields and formats.
    Validation,
    /// Existing-farmer check.
    Deduplication,
    /// Account lookup or provisioning.
    IdentityCreation,
    /// Farmer record creation.
    DomainRegistration,
    /// Identity to organization link.
    OrganizationLinkage,
    /// Optional field agent assignment.
    AgentAssignment,
}

impl StageKind {
    /// All stages in execution order.
    pub const ALL: [Self; 6] = [
        Self::Validation,
        Self::Deduplication,
        Self::IdentityCreation,
        Self::DomainRegistration,
        Self::OrganizationLinkage,
        Self::AgentAssignment,
    ];

    /// Stable stage name used in metrics, logs and errors.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Deduplication => "deduplication",
            Self::IdentityCreation => "identity_creation",
            Self::DomainRegistration => "domain_registration",
            Self::OrganizationLinkage => "organization_linkage",
            Self::AgentAssignment => "agent_assignment",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the validation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Phone number after stripping separators and country prefix.
    pub normalized_phone: String,
    /// Lower-cased gender, if supplied.
    pub normalized_gender: Option<String>,
}

/// What the deduplication stage decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupAction {
    /// No existing farmer; onboard as new.
    New,
    /// Duplicate under the `skip` policy.
    Skipped,
    /// Duplicate under the `update` policy; registration reconciles.
    Update,
    /// The existing farmer was created by an earlier attempt of this record.
    Resume,
}

/// Output of the deduplication stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationResult {
    /// Decision taken.
    pub action: DedupAction,
    /// Identifier of the matching farmer, if any.
    pub existing_farmer_id: Option<String>,
}

impl DeduplicationResult {
    /// Returns true if a matching farmer was found.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        self.existing_farmer_id.is_some()
    }
}

/// Output of the identity creation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityResult {
    /// Account identifier in the identity service.
    pub user_id: String,
    /// Login name derived from the phone number.
    pub username: String,
    /// True when an existing account was reused.
    pub user_existed: bool,
    /// True when the password was generated rather than supplied.
    pub password_generated: bool,
}

/// Output of the domain registration stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResult {
    /// Farmer record identifier.
    pub farmer_id: String,
    /// True when an existing farmer was reconciled instead of created.
    pub reused_existing: bool,
}

/// Output of the organization linkage stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkageResult {
    /// Linked farmer.
    pub farmer_id: String,
    /// Organization the farmer was linked to.
    pub org_id: String,
    /// When the link was made.
    pub linked_at: DateTime<Utc>,
}

/// Output of the agent assignment stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAssignmentResult {
    /// `Ok`, `Skip` (no agent) or `Fail` (downgraded failure).
    pub status: StageStatus,
    /// Agent requested for the batch.
    pub agent_id: Option<String>,
    /// Skip reason.
    pub reason: Option<String>,
    /// Failure message, when the assignment call failed.
    pub error: Option<String>,
}

impl AgentAssignmentResult {
    /// Agent assigned.
    #[must_use]
    pub fn assigned(agent_id: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Ok,
            agent_id: Some(agent_id.into()),
            reason: None,
            error: None,
        }
    }

    /// Nothing to assign.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skip,
            agent_id: None,
            reason: Some(reason.into()),
            error: None,
        }
    }

    /// Assignment attempted and failed; the record still succeeds.
    #[must_use]
    pub fn failed(agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            agent_id: Some(agent_id.into()),
            reason: None,
            error: Some(error.into()),
        }
    }
}

/// All results recorded so far for one record, one slot per stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResults {
    /// Validation output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    /// Deduplication output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplication: Option<DeduplicationResult>,
    /// Identity output.
    #[serde(rename = "identity_creation", skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityResult>,
    /// Registration output.
    #[serde(rename = "domain_registration", skip_serializing_if = "Option::is_none")]
    pub registration: Option<RegistrationResult>,
    /// Linkage output.
    #[serde(rename = "organization_linkage", skip_serializing_if = "Option::is_none")]
    pub linkage: Option<LinkageResult>,
    /// Agent assignment output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_assignment: Option<AgentAssignmentResult>,
}

impl StageResults {
    /// Returns true if the given stage has recorded a result.
    #[must_use]
    pub fn contains(&self, kind: StageKind) -> bool {
        match kind {
            StageKind::Validation => self.validation.is_some(),
            StageKind::Deduplication => self.deduplication.is_some(),
            StageKind::IdentityCreation => self.identity.is_some(),
            StageKind::DomainRegistration => self.registration.is_some(),
            StageKind::OrganizationLinkage => self.linkage.is_some(),
            StageKind::AgentAssignment => self.agent_assignment.is_some(),
        }
    }

    /// Names of the stages that recorded a result, in pipeline order.
    #[must_use]
    pub fn recorded(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|kind| self.contains(*kind))
            .collect()
    }

    /// Renders the results as a JSON object keyed by stage name.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

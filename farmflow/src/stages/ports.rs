//! Capability ports for the external collaborators the stages call.
//!
//! Each stage receives only the port it needs. The traits expose the narrow
//! surface the onboarding flow uses, never a collaborator's full API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::{Address, FarmerRecord};
use crate::errors::ServiceError;

/// An account in the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account identifier.
    pub id: String,
    /// Login name.
    pub username: String,
    /// Phone number the account is registered under.
    pub phone_number: String,
}

/// Request to provision a new account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountRequest {
    /// Login name.
    pub username: String,
    /// Normalized phone number.
    pub phone_number: String,
    /// Initial credential.
    #[serde(skip_serializing)]
    pub password: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Optional email.
    pub email: Option<String>,
    /// Organization the account is provisioned for.
    pub org_id: String,
}

/// Identity/authorization service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountService: Send + Sync {
    /// Finds the account registered under a phone number.
    async fn lookup_account_by_phone(&self, phone: &str) -> Result<Option<Account>, ServiceError>;

    /// Creates an account.
    async fn create_account(&self, request: CreateAccountRequest) -> Result<Account, ServiceError>;
}

/// Organization linkage service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LinkageService: Send + Sync {
    /// Links an identity to an organization as a farmer.
    async fn link_farmer_to_org(&self, identity_id: &str, org_id: &str)
        -> Result<(), ServiceError>;

    /// Assigns a field agent to a farmer within an organization.
    async fn assign_agent(
        &self,
        identity_id: &str,
        org_id: &str,
        agent_id: &str,
    ) -> Result<(), ServiceError>;
}

/// A persisted farmer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Farmer {
    /// Farmer identifier.
    pub id: String,
    /// Identity the farmer logs in with.
    pub user_id: String,
    /// Owning organization.
    pub org_id: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Normalized phone number.
    pub phone_number: String,
    /// Optional email.
    pub email: Option<String>,
    /// Optional gender.
    pub gender: Option<String>,
    /// Optional date of birth.
    pub date_of_birth: Option<String>,
    /// Optional address.
    pub address: Option<Address>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Profile written when creating or reconciling a farmer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmerProfile {
    /// Identity the farmer logs in with.
    pub user_id: String,
    /// Owning organization.
    pub org_id: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Normalized phone number.
    pub phone_number: String,
    /// Optional email.
    pub email: Option<String>,
    /// Optional gender.
    pub gender: Option<String>,
    /// Optional date of birth.
    pub date_of_birth: Option<String>,
    /// Optional address.
    pub address: Option<Address>,
}

impl FarmerProfile {
    /// Builds a profile from a validated record.
    #[must_use]
    pub fn from_record(
        record: &FarmerRecord,
        user_id: impl Into<String>,
        org_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            org_id: org_id.into(),
            first_name: record.first_name.clone(),
            last_name: record.last_name.clone(),
            phone_number: record.phone_number.clone(),
            email: record.email.clone(),
            gender: record.gender.clone(),
            date_of_birth: record.date_of_birth.clone(),
            address: record.address.clone(),
        }
    }
}

/// Domain registry of farmers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FarmerRegistry: Send + Sync {
    /// Finds a farmer by phone within an organization.
    async fn find_farmer_by_phone(
        &self,
        org_id: &str,
        phone: &str,
    ) -> Result<Option<Farmer>, ServiceError>;

    /// Creates a farmer.
    async fn create_farmer(&self, profile: FarmerProfile) -> Result<Farmer, ServiceError>;

    /// Overwrites an existing farmer's profile.
    async fn update_farmer(
        &self,
        farmer_id: &str,
        profile: FarmerProfile,
    ) -> Result<Farmer, ServiceError>;
}

/// The collaborators the onboarding pipeline is wired to.
#[derive(Clone)]
pub struct OnboardingServices {
    /// Identity service.
    pub accounts: Arc<dyn AccountService>,
    /// Linkage service.
    pub linkage: Arc<dyn LinkageService>,
    /// Farmer registry.
    pub registry: Arc<dyn FarmerRegistry>,
}

impl std::fmt::Debug for OnboardingServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnboardingServices").finish_non_exhaustive()
    }
}

impl OnboardingServices {
    /// Bundles the three collaborators.
    #[must_use]
    pub fn new(
        accounts: Arc<dyn AccountService>,
        linkage: Arc<dyn LinkageService>,
        registry: Arc<dyn FarmerRegistry>,
    ) -> Self {
        Self {
            accounts,
            linkage,
            registry,
        }
    }
}

//! In-memory collaborators with call counting and fault injection.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::stages::ports::{
    Account, AccountService, CreateAccountRequest, Farmer, FarmerProfile, FarmerRegistry,
    LinkageService, OnboardingServices,
};

/// A collaborator method that faults can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeCall {
    /// `lookup_account_by_phone`
    LookupAccount,
    /// `create_account`
    CreateAccount,
    /// `link_farmer_to_org`
    LinkFarmer,
    /// `assign_agent`
    AssignAgent,
    /// `find_farmer_by_phone`
    FindFarmer,
    /// `create_farmer`
    CreateFarmer,
    /// `update_farmer`
    UpdateFarmer,
}

/// Scripted failures, latency and call counts shared by the fakes.
#[derive(Debug, Default)]
pub struct FaultPlan {
    scripted: DashMap<FakeCall, VecDeque<ServiceError>>,
    persistent: DashMap<FakeCall, ServiceError>,
    latency: DashMap<FakeCall, Duration>,
    keyed_latency: DashMap<(FakeCall, String), Duration>,
    calls: DashMap<FakeCall, u64>,
}

impl FaultPlan {
    /// Fails the next `times` calls of `call` with `error`.
    pub fn fail_next(&self, call: FakeCall, error: ServiceError, times: usize) {
        let mut queue = self.scripted.entry(call).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Fails every call of `call` until cleared.
    pub fn fail_always(&self, call: FakeCall, error: ServiceError) {
        self.persistent.insert(call, error);
    }

    /// Delays every call of `call`.
    pub fn delay(&self, call: FakeCall, latency: Duration) {
        self.latency.insert(call, latency);
    }

    /// Delays calls of `call` made for `key` (a phone number, identity or
    /// farmer id, depending on the call). Overrides [`FaultPlan::delay`].
    pub fn delay_for(&self, call: FakeCall, key: impl Into<String>, latency: Duration) {
        self.keyed_latency.insert((call, key.into()), latency);
    }

    /// Removes all faults and latency for `call`.
    pub fn clear(&self, call: FakeCall) {
        self.scripted.remove(&call);
        self.persistent.remove(&call);
        self.latency.remove(&call);
        self.keyed_latency.retain(|(keyed, _), _| *keyed != call);
    }

    /// Number of times `call` was invoked.
    #[must_use]
    pub fn calls(&self, call: FakeCall) -> u64 {
        self.calls.get(&call).map_or(0, |count| *count)
    }

    async fn enter(&self, call: FakeCall, key: &str) -> Result<(), ServiceError> {
        *self.calls.entry(call).or_insert(0) += 1;

        let latency = self
            .keyed_latency
            .get(&(call, key.to_string()))
            .map(|latency| *latency)
            .or_else(|| self.latency.get(&call).map(|latency| *latency));
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .scripted
            .get_mut(&call)
            .and_then(|mut queue| queue.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }
        match self.persistent.get(&call) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Identity service keyed by phone number.
#[derive(Debug)]
pub struct FakeAccountService {
    accounts: DashMap<String, Account>,
    faults: Arc<FaultPlan>,
}

impl FakeAccountService {
    /// Creates an empty account service.
    #[must_use]
    pub fn new(faults: Arc<FaultPlan>) -> Self {
        Self {
            accounts: DashMap::new(),
            faults,
        }
    }

    /// Pre-registers an account.
    pub fn seed(&self, phone: &str, id: &str) {
        self.accounts.insert(
            phone.to_string(),
            Account {
                id: id.to_string(),
                username: phone.to_string(),
                phone_number: phone.to_string(),
            },
        );
    }

    /// Number of registered accounts.
    #[must_use]
    pub fn count(&self) -> usize {
        self.accounts.len()
    }

    /// Account registered under a phone number.
    #[must_use]
    pub fn get(&self, phone: &str) -> Option<Account> {
        self.accounts.get(phone).map(|account| account.value().clone())
    }
}

#[async_trait]
impl AccountService for FakeAccountService {
    async fn lookup_account_by_phone(&self, phone: &str) -> Result<Option<Account>, ServiceError> {
        self.faults.enter(FakeCall::LookupAccount, phone).await?;
        Ok(self.get(phone))
    }

    async fn create_account(&self, request: CreateAccountRequest) -> Result<Account, ServiceError> {
        self.faults.enter(FakeCall::CreateAccount, &request.phone_number).await?;
        match self.accounts.entry(request.phone_number.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ServiceError::rejected(
                409,
                format!("username '{}' already exists", request.username),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let account = Account {
                    id: format!("user-{}", Uuid::new_v4().simple()),
                    username: request.username,
                    phone_number: request.phone_number,
                };
                slot.insert(account.clone());
                Ok(account)
            }
        }
    }
}

/// Linkage service recording links and agent assignments.
#[derive(Debug)]
pub struct FakeLinkageService {
    links: Mutex<HashSet<(String, String)>>,
    assignments: Mutex<Vec<(String, String, String)>>,
    faults: Arc<FaultPlan>,
}

impl FakeLinkageService {
    /// Creates an empty linkage service.
    #[must_use]
    pub fn new(faults: Arc<FaultPlan>) -> Self {
        Self {
            links: Mutex::new(HashSet::new()),
            assignments: Mutex::new(Vec::new()),
            faults,
        }
    }

    /// Number of identity/org links.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    /// Whether an identity is linked to an org.
    #[must_use]
    pub fn is_linked(&self, identity_id: &str, org_id: &str) -> bool {
        self.links
            .lock()
            .contains(&(identity_id.to_string(), org_id.to_string()))
    }

    /// Recorded `(identity, org, agent)` assignments.
    #[must_use]
    pub fn assignments(&self) -> Vec<(String, String, String)> {
        self.assignments.lock().clone()
    }
}

#[async_trait]
impl LinkageService for FakeLinkageService {
    async fn link_farmer_to_org(&self, identity_id: &str, org_id: &str) -> Result<(), ServiceError> {
        self.faults.enter(FakeCall::LinkFarmer, identity_id).await?;
        let inserted = self
            .links
            .lock()
            .insert((identity_id.to_string(), org_id.to_string()));
        if inserted {
            Ok(())
        } else {
            Err(ServiceError::rejected(409, "identity already linked"))
        }
    }

    async fn assign_agent(
        &self,
        identity_id: &str,
        org_id: &str,
        agent_id: &str,
    ) -> Result<(), ServiceError> {
        self.faults.enter(FakeCall::AssignAgent, identity_id).await?;
        self.assignments.lock().push((
            identity_id.to_string(),
            org_id.to_string(),
            agent_id.to_string(),
        ));
        Ok(())
    }
}

/// Farmer registry keyed by farmer id.
#[derive(Debug)]
pub struct FakeFarmerRegistry {
    farmers: DashMap<String, Farmer>,
    faults: Arc<FaultPlan>,
}

impl FakeFarmerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(faults: Arc<FaultPlan>) -> Self {
        Self {
            farmers: DashMap::new(),
            faults,
        }
    }

    /// Inserts a farmer directly, bypassing faults.
    pub fn seed(&self, profile: FarmerProfile) -> Farmer {
        let farmer = new_farmer(profile);
        self.farmers.insert(farmer.id.clone(), farmer.clone());
        farmer
    }

    /// Number of farmers.
    #[must_use]
    pub fn count(&self) -> usize {
        self.farmers.len()
    }

    /// Farmer registered under a phone in an org.
    #[must_use]
    pub fn find(&self, org_id: &str, phone: &str) -> Option<Farmer> {
        self.farmers
            .iter()
            .find(|farmer| farmer.org_id == org_id && farmer.phone_number == phone)
            .map(|farmer| farmer.value().clone())
    }
}

fn new_farmer(profile: FarmerProfile) -> Farmer {
    let now = Utc::now();
    Farmer {
        id: format!("farmer-{}", Uuid::new_v4().simple()),
        user_id: profile.user_id,
        org_id: profile.org_id,
        first_name: profile.first_name,
        last_name: profile.last_name,
        phone_number: profile.phone_number,
        email: profile.email,
        gender: profile.gender,
        date_of_birth: profile.date_of_birth,
        address: profile.address,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl FarmerRegistry for FakeFarmerRegistry {
    async fn find_farmer_by_phone(
        &self,
        org_id: &str,
        phone: &str,
    ) -> Result<Option<Farmer>, ServiceError> {
        self.faults.enter(FakeCall::FindFarmer, phone).await?;
        Ok(self.find(org_id, phone))
    }

    async fn create_farmer(&self, profile: FarmerProfile) -> Result<Farmer, ServiceError> {
        self.faults.enter(FakeCall::CreateFarmer, &profile.phone_number).await?;
        if self.find(&profile.org_id, &profile.phone_number).is_some() {
            return Err(ServiceError::rejected(409, "farmer already exists"));
        }
        Ok(self.seed(profile))
    }

    async fn update_farmer(
        &self,
        farmer_id: &str,
        profile: FarmerProfile,
    ) -> Result<Farmer, ServiceError> {
        self.faults.enter(FakeCall::UpdateFarmer, farmer_id).await?;
        let mut farmer = self
            .farmers
            .get_mut(farmer_id)
            .ok_or_else(|| ServiceError::NotFound(format!("farmer {farmer_id}")))?;
        farmer.first_name = profile.first_name;
        farmer.last_name = profile.last_name;
        farmer.email = profile.email;
        farmer.gender = profile.gender;
        farmer.date_of_birth = profile.date_of_birth;
        farmer.address = profile.address;
        farmer.updated_at = Utc::now();
        Ok(farmer.clone())
    }
}

/// The three fakes wired to one fault plan.
#[derive(Debug, Clone)]
pub struct FakeServices {
    /// Identity service.
    pub accounts: Arc<FakeAccountService>,
    /// Linkage service.
    pub linkage: Arc<FakeLinkageService>,
    /// Farmer registry.
    pub registry: Arc<FakeFarmerRegistry>,
    /// Shared faults and call counts.
    pub faults: Arc<FaultPlan>,
}

impl Default for FakeServices {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServices {
    /// Creates empty fakes with no faults.
    #[must_use]
    pub fn new() -> Self {
        let faults = Arc::new(FaultPlan::default());
        Self {
            accounts: Arc::new(FakeAccountService::new(faults.clone())),
            linkage: Arc::new(FakeLinkageService::new(faults.clone())),
            registry: Arc::new(FakeFarmerRegistry::new(faults.clone())),
            faults,
        }
    }

    /// Wires the fakes as pipeline collaborators.
    #[must_use]
    pub fn services(&self) -> OnboardingServices {
        OnboardingServices::new(
            self.accounts.clone(),
            self.linkage.clone(),
            self.registry.clone(),
        )
    }
}

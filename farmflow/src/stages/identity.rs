//! Account lookup and provisioning.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::credentials::generate_password;
use super::guard::DependencyGuard;
use super::ports::{Account, AccountService, CreateAccountRequest};
use super::{Stage, StageFlow};
use crate::context::{IdentityResult, ProcessingContext, StageKind};
use crate::core::FarmerRecord;
use crate::errors::{ServiceError, StageError};

const CONFLICT: u16 = 409;

/// Finds or creates the farmer's account in the identity service.
///
/// The phone number is the natural key: an account already registered under
/// it is reused, which makes re-running the stage for the same record safe.
#[derive(Clone)]
pub struct IdentityCreationStage {
    accounts: Arc<dyn AccountService>,
    guard: DependencyGuard,
    timeout: Duration,
}

impl std::fmt::Debug for IdentityCreationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCreationStage")
            .field("breaker", &self.guard.breaker().name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl IdentityCreationStage {
    /// Creates a new identity stage.
    #[must_use]
    pub fn new(accounts: Arc<dyn AccountService>, guard: DependencyGuard) -> Self {
        Self {
            accounts,
            guard,
            timeout: Duration::ZERO,
        }
    }

    /// Sets the stage timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn lookup(
        &self,
        ctx: &ProcessingContext,
        phone: &str,
    ) -> Result<Option<Account>, StageError> {
        self.guard
            .call(ctx.cancellation(), "lookup_account_by_phone", || {
                self.accounts.lookup_account_by_phone(phone)
            })
            .await
    }
}

fn reused(account: Account) -> IdentityResult {
    IdentityResult {
        user_id: account.id,
        username: account.username,
        user_existed: true,
        password_generated: false,
    }
}

#[async_trait]
impl Stage for IdentityCreationStage {
    fn name(&self) -> &str {
        StageKind::IdentityCreation.as_str()
    }

    fn can_retry(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn process(
        &self,
        ctx: &mut ProcessingContext,
        record: FarmerRecord,
    ) -> Result<StageFlow, StageError> {
        let phone = ctx
            .require_validation(StageKind::IdentityCreation)?
            .normalized_phone
            .clone();

        if let Some(account) = self.lookup(ctx, &phone).await? {
            debug!(record_index = ctx.record_index(), user_id = %account.id, "reusing existing account");
            ctx.set_identity(reused(account));
            return Ok(StageFlow::Continue(record));
        }

        let (password, password_generated) = match record.password.as_deref() {
            Some(supplied) if !supplied.trim().is_empty() => (supplied.to_string(), false),
            _ => (generate_password(&phone).value, true),
        };
        let request = CreateAccountRequest {
            username: phone.clone(),
            phone_number: phone.clone(),
            password,
            first_name: record.first_name.clone(),
            last_name: record.last_name.clone(),
            email: record.email.clone(),
            org_id: ctx.org_id().to_string(),
        };

        let created = self
            .guard
            .call(ctx.cancellation(), "create_account", || {
                self.accounts.create_account(request.clone())
            })
            .await;

        let identity = match created {
            Ok(account) => {
                info!(record_index = ctx.record_index(), user_id = %account.id, "account created");
                IdentityResult {
                    user_id: account.id,
                    username: account.username,
                    user_existed: false,
                    password_generated,
                }
            }
            // Another writer registered the phone between lookup and create.
            Err(err) if is_conflict(&err) => match self.lookup(ctx, &phone).await? {
                Some(account) => reused(account),
                None => return Err(err),
            },
            Err(err) => return Err(err),
        };

        ctx.set_identity(identity);
        Ok(StageFlow::Continue(record))
    }
}

fn is_conflict(err: &StageError) -> bool {
    err.source
        .as_ref()
        .and_then(|source| source.downcast_ref::<ServiceError>())
        .is_some_and(|source| matches!(source, ServiceError::Rejected { status, .. } if *status == CONFLICT))
}

//! Persistence contracts for the credential store and the downstream
//! aggregates the provisioning saga writes.
//!
//! Username lookups take any spelling; implementations normalize before
//! comparing. Mutations of shared rows are conditional: identities are
//! compare-and-swap on `version`, refresh-token revocation and single-use
//! token consumption only succeed for the first caller.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::Database;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{
    AuthIdentity, AuthProvider, Invitation, Membership, Organization, PasswordResetToken, Plan,
    RefreshToken, SagaInstance, Subscription, User, VerificationToken,
};

#[async_trait]
pub trait AuthIdentityRepository: Send + Sync {
    async fn insert_identity(&self, identity: &AuthIdentity) -> Result<(), AppError>;

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Option<AuthIdentity>, AppError>;

    async fn find_identity_by_username(
        &self,
        username: &str,
    ) -> Result<Option<AuthIdentity>, AppError>;

    async fn find_identity_by_provider_and_username(
        &self,
        provider: AuthProvider,
        username: &str,
    ) -> Result<Option<AuthIdentity>, AppError>;

    async fn find_identity_by_provider_user_id(
        &self,
        provider: AuthProvider,
        provider_user_id: &str,
    ) -> Result<Option<AuthIdentity>, AppError>;

    /// Writes the full state if the stored version still equals
    /// `identity.version`, then bumps the version in place. A stale write
    /// fails with `AppError::Conflict`.
    async fn update_identity(&self, identity: &mut AuthIdentity) -> Result<(), AppError>;

    async fn delete_identity(&self, id: Uuid) -> Result<bool, AppError>;
}

#[async_trait]
pub trait RefreshTokenRepository: Send + Sync {
    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<(), AppError>;

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, AppError>;

    /// False when the token was already revoked.
    async fn revoke_refresh_token(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError>;

    /// Usable tokens of a user, oldest first.
    async fn list_active_refresh_tokens(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshToken>, AppError>;

    async fn revoke_all_refresh_tokens(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    async fn touch_refresh_token(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), AppError>;

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

#[async_trait]
pub trait VerificationTokenRepository: Send + Sync {
    async fn insert_verification_token(&self, token: &VerificationToken) -> Result<(), AppError>;

    async fn find_verification_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<VerificationToken>, AppError>;

    /// False when the token was already used.
    async fn mark_verification_token_used(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Supersedes every outstanding token of the identity; replaced tokens
    /// stop working immediately.
    async fn invalidate_verification_tokens(
        &self,
        auth_identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    async fn delete_verification_tokens_for_identity(
        &self,
        auth_identity_id: Uuid,
    ) -> Result<u64, AppError>;

    async fn delete_expired_verification_tokens(&self, now: DateTime<Utc>)
        -> Result<u64, AppError>;
}

#[async_trait]
pub trait PasswordResetTokenRepository: Send + Sync {
    async fn insert_reset_token(&self, token: &PasswordResetToken) -> Result<(), AppError>;

    async fn find_reset_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<PasswordResetToken>, AppError>;

    async fn mark_reset_token_used(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError>;

    async fn invalidate_reset_tokens(
        &self,
        auth_identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    async fn delete_reset_tokens_for_identity(&self, auth_identity_id: Uuid)
        -> Result<u64, AppError>;

    async fn delete_expired_reset_tokens(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Read side of users, organizations, memberships and invitations.
/// Writes go through [`UnitOfWork`].
#[async_trait]
pub trait DirectoryRepository: Send + Sync {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, AppError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError>;

    async fn find_organization_by_id(&self, id: Uuid) -> Result<Option<Organization>, AppError>;

    async fn list_memberships_for_user(&self, user_id: Uuid)
        -> Result<Vec<Membership>, AppError>;

    async fn count_active_memberships(&self, user_id: Uuid) -> Result<i64, AppError>;

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), AppError>;

    async fn find_invitation_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Invitation>, AppError>;
}

#[async_trait]
pub trait BillingRepository: Send + Sync {
    async fn find_subscription_for_organization(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<Subscription>, AppError>;

    async fn find_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError>;

    async fn count_classes(&self, organization_id: Uuid) -> Result<i64, AppError>;
}

#[async_trait]
pub trait SagaLog: Send + Sync {
    async fn insert_saga(&self, saga: &SagaInstance) -> Result<(), AppError>;

    async fn find_saga(&self, id: Uuid) -> Result<Option<SagaInstance>, AppError>;

    /// Compare-and-swap on `saga.version`, like identities.
    async fn update_saga(&self, saga: &mut SagaInstance) -> Result<(), AppError>;

    /// Sagas still `compensating` whose last update is older than `before`.
    async fn list_stalled_sagas(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<SagaInstance>, AppError>;
}

/// Attach an identity to its user. Only succeeds while the identity is
/// still unlinked.
#[derive(Debug, Clone)]
pub struct IdentityLink {
    pub auth_identity_id: Uuid,
    pub user_id: Uuid,
    pub mark_email_verified: bool,
}

/// Accept an invitation. Only succeeds while it is still pending.
#[derive(Debug, Clone)]
pub struct InvitationAcceptance {
    pub invitation_id: Uuid,
}

/// Writes staged by one synchronous saga leg.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub users: Vec<User>,
    pub organizations: Vec<Organization>,
    pub memberships: Vec<Membership>,
    pub identity_links: Vec<IdentityLink>,
    pub invitation_acceptances: Vec<InvitationAcceptance>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.organizations.is_empty()
            && self.memberships.is_empty()
            && self.identity_links.is_empty()
            && self.invitation_acceptances.is_empty()
    }
}

/// Transaction boundary: either every change in the set lands or none does.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn commit(&self, changes: ChangeSet, now: DateTime<Utc>) -> Result<(), AppError>;
}

/// Resolved persistence dependencies, handed to services at startup.
#[derive(Clone)]
pub struct Backends {
    pub identities: Arc<dyn AuthIdentityRepository>,
    pub refresh_tokens: Arc<dyn RefreshTokenRepository>,
    pub verification_tokens: Arc<dyn VerificationTokenRepository>,
    pub reset_tokens: Arc<dyn PasswordResetTokenRepository>,
    pub directory: Arc<dyn DirectoryRepository>,
    pub billing: Arc<dyn BillingRepository>,
    pub sagas: Arc<dyn SagaLog>,
    pub unit_of_work: Arc<dyn UnitOfWork>,
}

impl Backends {
    /// Every contract served by one store.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: AuthIdentityRepository
            + RefreshTokenRepository
            + VerificationTokenRepository
            + PasswordResetTokenRepository
            + DirectoryRepository
            + BillingRepository
            + SagaLog
            + UnitOfWork
            + 'static,
    {
        Self {
            identities: store.clone(),
            refresh_tokens: store.clone(),
            verification_tokens: store.clone(),
            reset_tokens: store.clone(),
            directory: store.clone(),
            billing: store.clone(),
            sagas: store.clone(),
            unit_of_work: store,
        }
    }
}

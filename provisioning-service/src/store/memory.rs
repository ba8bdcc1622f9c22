//! In-process store used by tests and local runs.
//!
//! All tables sit behind one mutex, so every trait call (and every
//! [`UnitOfWork::commit`]) is atomic with respect to the others.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    AuthIdentityRepository, BillingRepository, ChangeSet, DirectoryRepository,
    PasswordResetTokenRepository, RefreshTokenRepository, SagaLog, UnitOfWork,
    VerificationTokenRepository,
};
use crate::models::{
    normalize_username, AuthIdentity, AuthProvider, Invitation, InvitationStatus, Membership,
    Organization, PasswordResetToken, Plan, RefreshToken, SagaInstance, SagaStatus, Subscription,
    User, VerificationToken,
};
use crate::utils::hashes_match;

#[derive(Default)]
struct Tables {
    identities: HashMap<Uuid, AuthIdentity>,
    refresh_tokens: HashMap<Uuid, RefreshToken>,
    verification_tokens: HashMap<Uuid, VerificationToken>,
    reset_tokens: HashMap<Uuid, PasswordResetToken>,
    users: HashMap<Uuid, User>,
    organizations: HashMap<Uuid, Organization>,
    memberships: HashMap<Uuid, Membership>,
    invitations: HashMap<Uuid, Invitation>,
    plans: HashMap<Uuid, Plan>,
    subscriptions: HashMap<Uuid, Subscription>,
    class_counts: HashMap<Uuid, i64>,
    sagas: HashMap<Uuid, SagaInstance>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, AppError> {
        self.tables
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }

    // ==================== Seeding / inspection ====================

    pub fn seed_user(&self, user: User) -> Result<(), AppError> {
        self.tables()?.users.insert(user.id, user);
        Ok(())
    }

    pub fn seed_organization(&self, organization: Organization) -> Result<(), AppError> {
        self.tables()?
            .organizations
            .insert(organization.id, organization);
        Ok(())
    }

    pub fn seed_membership(&self, membership: Membership) -> Result<(), AppError> {
        self.tables()?.memberships.insert(membership.id, membership);
        Ok(())
    }

    pub fn seed_plan(&self, plan: Plan) -> Result<(), AppError> {
        self.tables()?.plans.insert(plan.id, plan);
        Ok(())
    }

    pub fn seed_subscription(&self, subscription: Subscription) -> Result<(), AppError> {
        self.tables()?
            .subscriptions
            .insert(subscription.id, subscription);
        Ok(())
    }

    pub fn set_class_count(&self, organization_id: Uuid, count: i64) -> Result<(), AppError> {
        self.tables()?.class_counts.insert(organization_id, count);
        Ok(())
    }

    pub fn set_user_status(
        &self,
        user_id: Uuid,
        status: crate::models::UserStatus,
    ) -> Result<(), AppError> {
        let mut tables = self.tables()?;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("User {} not found", user_id)))?;
        user.status = status;
        Ok(())
    }

    pub fn identities(&self) -> Result<Vec<AuthIdentity>, AppError> {
        Ok(self.tables()?.identities.values().cloned().collect())
    }

    pub fn users(&self) -> Result<Vec<User>, AppError> {
        Ok(self.tables()?.users.values().cloned().collect())
    }

    pub fn organizations(&self) -> Result<Vec<Organization>, AppError> {
        Ok(self.tables()?.organizations.values().cloned().collect())
    }

    pub fn memberships(&self) -> Result<Vec<Membership>, AppError> {
        Ok(self.tables()?.memberships.values().cloned().collect())
    }

    pub fn refresh_tokens(&self) -> Result<Vec<RefreshToken>, AppError> {
        Ok(self.tables()?.refresh_tokens.values().cloned().collect())
    }

    pub fn verification_tokens(&self) -> Result<Vec<VerificationToken>, AppError> {
        Ok(self.tables()?.verification_tokens.values().cloned().collect())
    }

    pub fn find_invitation(&self, id: Uuid) -> Result<Option<Invitation>, AppError> {
        Ok(self.tables()?.invitations.get(&id).cloned())
    }
}

fn conflict(message: String) -> AppError {
    AppError::Conflict(anyhow::anyhow!(message))
}

#[async_trait]
impl AuthIdentityRepository for MemoryStore {
    async fn insert_identity(&self, identity: &AuthIdentity) -> Result<(), AppError> {
        let mut tables = self.tables()?;
        let duplicate = tables.identities.values().any(|existing| {
            existing.provider == identity.provider
                && (existing.provider_user_id == identity.provider_user_id
                    || existing.username == identity.username)
        });
        if duplicate {
            return Err(conflict(format!(
                "Identity for {} already exists",
                identity.username
            )));
        }
        tables.identities.insert(identity.id, identity.clone());
        Ok(())
    }

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Option<AuthIdentity>, AppError> {
        Ok(self.tables()?.identities.get(&id).cloned())
    }

    async fn find_identity_by_username(
        &self,
        username: &str,
    ) -> Result<Option<AuthIdentity>, AppError> {
        let username = normalize_username(username);
        let tables = self.tables()?;
        let mut matches: Vec<&AuthIdentity> = tables
            .identities
            .values()
            .filter(|identity| identity.username == username)
            .collect();
        matches.sort_by_key(|identity| identity.created_at);
        Ok(matches.first().map(|identity| (*identity).clone()))
    }

    async fn find_identity_by_provider_and_username(
        &self,
        provider: AuthProvider,
        username: &str,
    ) -> Result<Option<AuthIdentity>, AppError> {
        let username = normalize_username(username);
        Ok(self
            .tables()?
            .identities
            .values()
            .find(|identity| identity.provider == provider && identity.username == username)
            .cloned())
    }

    async fn find_identity_by_provider_user_id(
        &self,
        provider: AuthProvider,
        provider_user_id: &str,
    ) -> Result<Option<AuthIdentity>, AppError> {
        Ok(self
            .tables()?
            .identities
            .values()
            .find(|identity| {
                identity.provider == provider && identity.provider_user_id == provider_user_id
            })
            .cloned())
    }

    async fn update_identity(&self, identity: &mut AuthIdentity) -> Result<(), AppError> {
        let mut tables = self.tables()?;
        let stored = tables.identities.get_mut(&identity.id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Identity {} not found", identity.id))
        })?;

        if stored.version != identity.version {
            return Err(conflict(format!(
                "Concurrent modification of identity {} (expected version {}, found {})",
                identity.id, identity.version, stored.version
            )));
        }

        identity.version += 1;
        *stored = identity.clone();
        Ok(())
    }

    async fn delete_identity(&self, id: Uuid) -> Result<bool, AppError> {
        Ok(self.tables()?.identities.remove(&id).is_some())
    }
}

#[async_trait]
impl RefreshTokenRepository for MemoryStore {
    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<(), AppError> {
        self.tables()?
            .refresh_tokens
            .insert(token.id, token.clone());
        Ok(())
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, AppError> {
        Ok(self
            .tables()?
            .refresh_tokens
            .values()
            .find(|token| hashes_match(&token.token_hash, token_hash))
            .cloned())
    }

    async fn revoke_refresh_token(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let mut tables = self.tables()?;
        match tables.refresh_tokens.get_mut(&id) {
            Some(token) if !token.is_revoked => {
                token.is_revoked = true;
                token.revoked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active_refresh_tokens(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshToken>, AppError> {
        let tables = self.tables()?;
        let mut active: Vec<RefreshToken> = tables
            .refresh_tokens
            .values()
            .filter(|token| token.user_id == user_id && token.is_usable(now))
            .cloned()
            .collect();
        active.sort_by_key(|token| token.created_at);
        Ok(active)
    }

    async fn revoke_all_refresh_tokens(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut tables = self.tables()?;
        let mut revoked = 0;
        for token in tables.refresh_tokens.values_mut() {
            if token.user_id == user_id && !token.is_revoked {
                token.is_revoked = true;
                token.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn touch_refresh_token(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        if let Some(token) = self.tables()?.refresh_tokens.get_mut(&id) {
            token.last_used_at = Some(now);
        }
        Ok(())
    }

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut tables = self.tables()?;
        let before = tables.refresh_tokens.len();
        tables.refresh_tokens.retain(|_, token| !token.is_expired(now));
        Ok((before - tables.refresh_tokens.len()) as u64)
    }
}

#[async_trait]
impl VerificationTokenRepository for MemoryStore {
    async fn insert_verification_token(&self, token: &VerificationToken) -> Result<(), AppError> {
        self.tables()?
            .verification_tokens
            .insert(token.id, token.clone());
        Ok(())
    }

    async fn find_verification_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<VerificationToken>, AppError> {
        Ok(self
            .tables()?
            .verification_tokens
            .values()
            .find(|token| hashes_match(&token.token_hash, token_hash))
            .cloned())
    }

    async fn mark_verification_token_used(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut tables = self.tables()?;
        match tables.verification_tokens.get_mut(&id) {
            Some(token) => Ok(token.mark_as_used(now).is_ok()),
            None => Ok(false),
        }
    }

    async fn invalidate_verification_tokens(
        &self,
        auth_identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut tables = self.tables()?;
        let mut superseded = 0;
        for token in tables.verification_tokens.values_mut() {
            if token.auth_identity_id == auth_identity_id
                && !token.is_expired(now)
                && token.supersede(now)
            {
                superseded += 1;
            }
        }
        Ok(superseded)
    }

    async fn delete_verification_tokens_for_identity(
        &self,
        auth_identity_id: Uuid,
    ) -> Result<u64, AppError> {
        let mut tables = self.tables()?;
        let before = tables.verification_tokens.len();
        tables
            .verification_tokens
            .retain(|_, token| token.auth_identity_id != auth_identity_id);
        Ok((before - tables.verification_tokens.len()) as u64)
    }

    async fn delete_expired_verification_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut tables = self.tables()?;
        let before = tables.verification_tokens.len();
        tables
            .verification_tokens
            .retain(|_, token| !token.is_expired(now));
        Ok((before - tables.verification_tokens.len()) as u64)
    }
}

#[async_trait]
impl PasswordResetTokenRepository for MemoryStore {
    async fn insert_reset_token(&self, token: &PasswordResetToken) -> Result<(), AppError> {
        self.tables()?.reset_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn find_reset_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<PasswordResetToken>, AppError> {
        Ok(self
            .tables()?
            .reset_tokens
            .values()
            .find(|token| hashes_match(&token.token_hash, token_hash))
            .cloned())
    }

    async fn mark_reset_token_used(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let mut tables = self.tables()?;
        match tables.reset_tokens.get_mut(&id) {
            Some(token) => Ok(token.mark_as_used(now).is_ok()),
            None => Ok(false),
        }
    }

    async fn invalidate_reset_tokens(
        &self,
        auth_identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut tables = self.tables()?;
        let mut superseded = 0;
        for token in tables.reset_tokens.values_mut() {
            if token.auth_identity_id == auth_identity_id
                && !token.is_expired(now)
                && token.supersede(now)
            {
                superseded += 1;
            }
        }
        Ok(superseded)
    }

    async fn delete_reset_tokens_for_identity(
        &self,
        auth_identity_id: Uuid,
    ) -> Result<u64, AppError> {
        let mut tables = self.tables()?;
        let before = tables.reset_tokens.len();
        tables
            .reset_tokens
            .retain(|_, token| token.auth_identity_id != auth_identity_id);
        Ok((before - tables.reset_tokens.len()) as u64)
    }

    async fn delete_expired_reset_tokens(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut tables = self.tables()?;
        let before = tables.reset_tokens.len();
        tables.reset_tokens.retain(|_, token| !token.is_expired(now));
        Ok((before - tables.reset_tokens.len()) as u64)
    }
}

#[async_trait]
impl DirectoryRepository for MemoryStore {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, AppError> {
        Ok(self.tables()?.users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let email = normalize_username(email);
        Ok(self
            .tables()?
            .users
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    async fn find_organization_by_id(&self, id: Uuid) -> Result<Option<Organization>, AppError> {
        Ok(self.tables()?.organizations.get(&id).cloned())
    }

    async fn list_memberships_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Membership>, AppError> {
        let tables = self.tables()?;
        let mut memberships: Vec<Membership> = tables
            .memberships
            .values()
            .filter(|membership| membership.user_id == user_id)
            .cloned()
            .collect();
        memberships.sort_by_key(|membership| membership.created_at);
        Ok(memberships)
    }

    async fn count_active_memberships(&self, user_id: Uuid) -> Result<i64, AppError> {
        Ok(self
            .tables()?
            .memberships
            .values()
            .filter(|membership| membership.user_id == user_id && membership.is_active())
            .count() as i64)
    }

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), AppError> {
        self.tables()?
            .invitations
            .insert(invitation.id, invitation.clone());
        Ok(())
    }

    async fn find_invitation_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Invitation>, AppError> {
        Ok(self
            .tables()?
            .invitations
            .values()
            .find(|invitation| hashes_match(&invitation.token_hash, token_hash))
            .cloned())
    }
}

#[async_trait]
impl BillingRepository for MemoryStore {
    async fn find_subscription_for_organization(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self
            .tables()?
            .subscriptions
            .values()
            .find(|subscription| subscription.organization_id == organization_id)
            .cloned())
    }

    async fn find_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        Ok(self.tables()?.plans.get(&plan_id).cloned())
    }

    async fn count_classes(&self, organization_id: Uuid) -> Result<i64, AppError> {
        Ok(self
            .tables()?
            .class_counts
            .get(&organization_id)
            .copied()
            .unwrap_or(0))
    }
}

#[async_trait]
impl SagaLog for MemoryStore {
    async fn insert_saga(&self, saga: &SagaInstance) -> Result<(), AppError> {
        self.tables()?.sagas.insert(saga.id, saga.clone());
        Ok(())
    }

    async fn find_saga(&self, id: Uuid) -> Result<Option<SagaInstance>, AppError> {
        Ok(self.tables()?.sagas.get(&id).cloned())
    }

    async fn update_saga(&self, saga: &mut SagaInstance) -> Result<(), AppError> {
        let mut tables = self.tables()?;
        let stored = tables
            .sagas
            .get_mut(&saga.id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Saga {} not found", saga.id)))?;

        if stored.version != saga.version {
            return Err(conflict(format!(
                "Concurrent modification of saga {}",
                saga.id
            )));
        }

        saga.version += 1;
        *stored = saga.clone();
        Ok(())
    }

    async fn list_stalled_sagas(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<SagaInstance>, AppError> {
        let tables = self.tables()?;
        let mut stalled: Vec<SagaInstance> = tables
            .sagas
            .values()
            .filter(|saga| saga.status == SagaStatus::Compensating && saga.updated_at < before)
            .cloned()
            .collect();
        stalled.sort_by_key(|saga| saga.updated_at);
        Ok(stalled)
    }
}

#[async_trait]
impl UnitOfWork for MemoryStore {
    async fn commit(&self, changes: ChangeSet, now: DateTime<Utc>) -> Result<(), AppError> {
        let mut tables = self.tables()?;

        // Validate everything before the first write.
        for (index, user) in changes.users.iter().enumerate() {
            let taken = tables.users.values().any(|existing| existing.email == user.email)
                || changes.users[..index]
                    .iter()
                    .any(|staged| staged.email == user.email);
            if taken {
                return Err(conflict(format!("User {} already exists", user.email)));
            }
        }

        for link in &changes.identity_links {
            match tables.identities.get(&link.auth_identity_id) {
                Some(identity) if identity.user_id.is_none() => {}
                Some(_) => {
                    return Err(conflict(format!(
                        "Identity {} is already linked",
                        link.auth_identity_id
                    )))
                }
                None => {
                    return Err(AppError::NotFound(anyhow::anyhow!(
                        "Identity {} not found",
                        link.auth_identity_id
                    )))
                }
            }
        }

        for acceptance in &changes.invitation_acceptances {
            match tables.invitations.get(&acceptance.invitation_id) {
                Some(invitation) if invitation.status == InvitationStatus::Pending => {}
                _ => {
                    return Err(conflict(format!(
                        "Invitation {} is no longer pending",
                        acceptance.invitation_id
                    )))
                }
            }
        }

        for user in changes.users {
            tables.users.insert(user.id, user);
        }
        for organization in changes.organizations {
            tables.organizations.insert(organization.id, organization);
        }
        for membership in changes.memberships {
            tables.memberships.insert(membership.id, membership);
        }
        for link in changes.identity_links {
            if let Some(identity) = tables.identities.get_mut(&link.auth_identity_id) {
                identity.link_user(link.user_id, now);
                if link.mark_email_verified && !identity.is_email_verified {
                    identity.mark_email_verified(now);
                }
                identity.version += 1;
            }
        }
        for acceptance in changes.invitation_acceptances {
            if let Some(invitation) = tables.invitations.get_mut(&acceptance.invitation_id) {
                invitation.status = InvitationStatus::Accepted;
                invitation.accepted_at = Some(now);
            }
        }

        Ok(())
    }
}

//! PostgreSQL implementation of the store contracts.
//!
//! Rows are read into flat structs and decoded into domain models; enum
//! columns hold the lowercase codes of the model types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::{
    AuthIdentityRepository, BillingRepository, ChangeSet, DirectoryRepository,
    PasswordResetTokenRepository, RefreshTokenRepository, SagaLog, UnitOfWork,
    VerificationTokenRepository,
};
use crate::models::{
    normalize_username, AuthIdentity, AuthProvider, ClientFamily, DeviceDescriptor, Invitation,
    InvitationStatus, Membership, MembershipRole, MembershipStatus, Organization, OsFamily,
    PasswordResetToken, Plan, PlanTier, RefreshToken, SagaInstance, SagaKind, SagaStatus,
    SagaStep, Subscription, SubscriptionStatus, User, UserStatus, VerificationToken,
};

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Health check - ping the database.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!("Database health check failed: {}", e))
            })?;
        Ok(())
    }
}

fn db_error(e: sqlx::Error) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict(anyhow::anyhow!(e))
        }
        _ => AppError::DatabaseError(anyhow::anyhow!(e)),
    }
}

fn decode<T>(value: &str, parse: fn(&str) -> Option<T>, column: &str) -> Result<T, AppError> {
    parse(value).ok_or_else(|| {
        AppError::DatabaseError(anyhow::anyhow!("Unknown {} code '{}'", column, value))
    })
}

// ==================== Rows ====================

#[derive(sqlx::FromRow)]
struct IdentityRow {
    id: Uuid,
    provider: String,
    provider_user_id: String,
    username: String,
    user_id: Option<Uuid>,
    password_hash: Option<String>,
    failed_login_attempts: i32,
    last_failed_login_at: Option<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
    is_locked: bool,
    is_email_verified: bool,
    email_verified_at: Option<DateTime<Utc>>,
    last_login_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IdentityRow> for AuthIdentity {
    type Error = AppError;

    fn try_from(row: IdentityRow) -> Result<Self, Self::Error> {
        Ok(AuthIdentity {
            id: row.id,
            provider: decode(&row.provider, AuthProvider::from_code, "provider")?,
            provider_user_id: row.provider_user_id,
            username: row.username,
            user_id: row.user_id,
            password_hash: row.password_hash,
            failed_login_attempts: row.failed_login_attempts,
            last_failed_login_at: row.last_failed_login_at,
            locked_until: row.locked_until,
            is_locked: row.is_locked,
            is_email_verified: row.is_email_verified,
            email_verified_at: row.email_verified_at,
            last_login_at: row.last_login_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RefreshTokenRow {
    id: Uuid,
    user_id: Uuid,
    auth_identity_id: Uuid,
    token_hash: String,
    provider: Option<String>,
    client_family: Option<String>,
    os_family: Option<String>,
    ip_address: Option<String>,
    is_revoked: bool,
    revoked_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RefreshTokenRow> for RefreshToken {
    type Error = AppError;

    fn try_from(row: RefreshTokenRow) -> Result<Self, Self::Error> {
        let provider = row
            .provider
            .as_deref()
            .map(|code| decode(code, AuthProvider::from_code, "provider"))
            .transpose()?;

        let device = match (row.client_family.as_deref(), row.os_family.as_deref()) {
            (Some(client), Some(os)) => Some(DeviceDescriptor::new(
                decode(client, ClientFamily::from_code, "client_family")?,
                decode(os, OsFamily::from_code, "os_family")?,
            )),
            _ => None,
        };

        Ok(RefreshToken {
            id: row.id,
            user_id: row.user_id,
            auth_identity_id: row.auth_identity_id,
            token_hash: row.token_hash,
            provider,
            device,
            ip_address: row.ip_address,
            is_revoked: row.is_revoked,
            revoked_at: row.revoked_at,
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SingleUseTokenRow {
    id: Uuid,
    auth_identity_id: Uuid,
    token_hash: String,
    is_used: bool,
    used_at: Option<DateTime<Utc>>,
    superseded_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<SingleUseTokenRow> for VerificationToken {
    fn from(row: SingleUseTokenRow) -> Self {
        VerificationToken {
            id: row.id,
            auth_identity_id: row.auth_identity_id,
            token_hash: row.token_hash,
            is_used: row.is_used,
            used_at: row.used_at,
            superseded_at: row.superseded_at,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

impl From<SingleUseTokenRow> for PasswordResetToken {
    fn from(row: SingleUseTokenRow) -> Self {
        PasswordResetToken {
            id: row.id,
            auth_identity_id: row.auth_identity_id,
            token_hash: row.token_hash,
            is_used: row.is_used,
            used_at: row.used_at,
            superseded_at: row.superseded_at,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    first_name: String,
    last_name: String,
    email: String,
    auth_identity_id: Uuid,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = AppError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: row.id,
            first_name: row.first_name,
            last_name: row.last_name,
            email: row.email,
            auth_identity_id: row.auth_identity_id,
            status: decode(&row.status, UserStatus::from_code, "status")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    owner_user_id: Uuid,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MembershipRow {
    id: Uuid,
    user_id: Uuid,
    organization_id: Uuid,
    role: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MembershipRow> for Membership {
    type Error = AppError;

    fn try_from(row: MembershipRow) -> Result<Self, Self::Error> {
        Ok(Membership {
            id: row.id,
            user_id: row.user_id,
            organization_id: row.organization_id,
            role: decode(&row.role, MembershipRole::from_code, "role")?,
            status: decode(&row.status, MembershipStatus::from_code, "status")?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InvitationRow {
    id: Uuid,
    organization_id: Uuid,
    email: String,
    role: String,
    token_hash: String,
    status: String,
    expires_at: DateTime<Utc>,
    accepted_at: Option<DateTime<Utc>>,
    invited_by: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<InvitationRow> for Invitation {
    type Error = AppError;

    fn try_from(row: InvitationRow) -> Result<Self, Self::Error> {
        Ok(Invitation {
            id: row.id,
            organization_id: row.organization_id,
            email: row.email,
            role: decode(&row.role, MembershipRole::from_code, "role")?,
            token_hash: row.token_hash,
            status: decode(&row.status, InvitationStatus::from_code, "status")?,
            expires_at: row.expires_at,
            accepted_at: row.accepted_at,
            invited_by: row.invited_by,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    organization_id: Uuid,
    plan_id: Uuid,
    status: String,
    quantity: i64,
    pending_quantity: Option<i64>,
    is_trial_active: bool,
}

#[derive(sqlx::FromRow)]
struct SagaRow {
    id: Uuid,
    kind: String,
    step: String,
    status: String,
    username: String,
    auth_identity_id: Option<Uuid>,
    error: Option<String>,
    compensation_attempts: i32,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SagaRow> for SagaInstance {
    type Error = AppError;

    fn try_from(row: SagaRow) -> Result<Self, Self::Error> {
        Ok(SagaInstance {
            id: row.id,
            kind: decode(&row.kind, SagaKind::from_code, "kind")?,
            step: decode(&row.step, SagaStep::from_code, "step")?,
            status: decode(&row.status, SagaStatus::from_code, "status")?,
            username: row.username,
            auth_identity_id: row.auth_identity_id,
            error: row.error,
            compensation_attempts: row.compensation_attempts,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ==================== Identities ====================

#[async_trait]
impl AuthIdentityRepository for Database {
    async fn insert_identity(&self, identity: &AuthIdentity) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO auth_identities (
                id, provider, provider_user_id, username, user_id, password_hash,
                failed_login_attempts, last_failed_login_at, locked_until, is_locked,
                is_email_verified, email_verified_at, last_login_at, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(identity.id)
        .bind(identity.provider.as_str())
        .bind(&identity.provider_user_id)
        .bind(&identity.username)
        .bind(identity.user_id)
        .bind(&identity.password_hash)
        .bind(identity.failed_login_attempts)
        .bind(identity.last_failed_login_at)
        .bind(identity.locked_until)
        .bind(identity.is_locked)
        .bind(identity.is_email_verified)
        .bind(identity.email_verified_at)
        .bind(identity.last_login_at)
        .bind(identity.version)
        .bind(identity.created_at)
        .bind(identity.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_identity_by_id(&self, id: Uuid) -> Result<Option<AuthIdentity>, AppError> {
        sqlx::query_as::<_, IdentityRow>("SELECT * FROM auth_identities WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(AuthIdentity::try_from)
            .transpose()
    }

    async fn find_identity_by_username(
        &self,
        username: &str,
    ) -> Result<Option<AuthIdentity>, AppError> {
        sqlx::query_as::<_, IdentityRow>(
            "SELECT * FROM auth_identities WHERE username = $1 ORDER BY created_at LIMIT 1",
        )
        .bind(normalize_username(username))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(AuthIdentity::try_from)
        .transpose()
    }

    async fn find_identity_by_provider_and_username(
        &self,
        provider: AuthProvider,
        username: &str,
    ) -> Result<Option<AuthIdentity>, AppError> {
        sqlx::query_as::<_, IdentityRow>(
            "SELECT * FROM auth_identities WHERE provider = $1 AND username = $2",
        )
        .bind(provider.as_str())
        .bind(normalize_username(username))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(AuthIdentity::try_from)
        .transpose()
    }

    async fn find_identity_by_provider_user_id(
        &self,
        provider: AuthProvider,
        provider_user_id: &str,
    ) -> Result<Option<AuthIdentity>, AppError> {
        sqlx::query_as::<_, IdentityRow>(
            "SELECT * FROM auth_identities WHERE provider = $1 AND provider_user_id = $2",
        )
        .bind(provider.as_str())
        .bind(provider_user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(AuthIdentity::try_from)
        .transpose()
    }

    async fn update_identity(&self, identity: &mut AuthIdentity) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE auth_identities SET
                provider_user_id = $3, username = $4, user_id = $5, password_hash = $6,
                failed_login_attempts = $7, last_failed_login_at = $8, locked_until = $9,
                is_locked = $10, is_email_verified = $11, email_verified_at = $12,
                last_login_at = $13, updated_at = $14, version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(identity.id)
        .bind(identity.version)
        .bind(&identity.provider_user_id)
        .bind(&identity.username)
        .bind(identity.user_id)
        .bind(&identity.password_hash)
        .bind(identity.failed_login_attempts)
        .bind(identity.last_failed_login_at)
        .bind(identity.locked_until)
        .bind(identity.is_locked)
        .bind(identity.is_email_verified)
        .bind(identity.email_verified_at)
        .bind(identity.last_login_at)
        .bind(identity.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Concurrent modification of identity {} at version {}",
                identity.id,
                identity.version
            )));
        }

        identity.version += 1;
        Ok(())
    }

    async fn delete_identity(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM auth_identities WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() > 0)
    }
}

// ==================== Refresh tokens ====================

#[async_trait]
impl RefreshTokenRepository for Database {
    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (
                id, user_id, auth_identity_id, token_hash, provider, client_family, os_family,
                ip_address, is_revoked, revoked_at, expires_at, last_used_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(token.auth_identity_id)
        .bind(&token.token_hash)
        .bind(token.provider.map(|p| p.as_str()))
        .bind(token.device.as_ref().map(|d| d.client_family.as_str()))
        .bind(token.device.as_ref().map(|d| d.os_family.as_str()))
        .bind(&token.ip_address)
        .bind(token.is_revoked)
        .bind(token.revoked_at)
        .bind(token.expires_at)
        .bind(token.last_used_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, AppError> {
        sqlx::query_as::<_, RefreshTokenRow>("SELECT * FROM refresh_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(RefreshToken::try_from)
            .transpose()
    }

    async fn revoke_refresh_token(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET is_revoked = TRUE, revoked_at = $2 WHERE id = $1 AND is_revoked = FALSE",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_active_refresh_tokens(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshToken>, AppError> {
        sqlx::query_as::<_, RefreshTokenRow>(
            r#"
            SELECT * FROM refresh_tokens
            WHERE user_id = $1 AND is_revoked = FALSE AND expires_at >= $2
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?
        .into_iter()
        .map(RefreshToken::try_from)
        .collect()
    }

    async fn revoke_all_refresh_tokens(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET is_revoked = TRUE, revoked_at = $2 WHERE user_id = $1 AND is_revoked = FALSE",
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn touch_refresh_token(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE refresh_tokens SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

// ==================== Single-use tokens ====================

#[async_trait]
impl VerificationTokenRepository for Database {
    async fn insert_verification_token(&self, token: &VerificationToken) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO verification_tokens (id, auth_identity_id, token_hash, is_used, used_at, superseded_at, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(token.id)
        .bind(token.auth_identity_id)
        .bind(&token.token_hash)
        .bind(token.is_used)
        .bind(token.used_at)
        .bind(token.superseded_at)
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_verification_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<VerificationToken>, AppError> {
        let row = sqlx::query_as::<_, SingleUseTokenRow>(
            "SELECT * FROM verification_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(row.map(VerificationToken::from))
    }

    async fn mark_verification_token_used(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE verification_tokens SET is_used = TRUE, used_at = $2
            WHERE id = $1 AND is_used = FALSE AND superseded_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn invalidate_verification_tokens(
        &self,
        auth_identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE verification_tokens SET superseded_at = $2
            WHERE auth_identity_id = $1 AND is_used = FALSE AND superseded_at IS NULL
              AND expires_at >= $2
            "#,
        )
        .bind(auth_identity_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_verification_tokens_for_identity(
        &self,
        auth_identity_id: Uuid,
    ) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM verification_tokens WHERE auth_identity_id = $1")
            .bind(auth_identity_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_verification_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM verification_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PasswordResetTokenRepository for Database {
    async fn insert_reset_token(&self, token: &PasswordResetToken) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO password_reset_tokens (id, auth_identity_id, token_hash, is_used, used_at, superseded_at, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(token.id)
        .bind(token.auth_identity_id)
        .bind(&token.token_hash)
        .bind(token.is_used)
        .bind(token.used_at)
        .bind(token.superseded_at)
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_reset_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<PasswordResetToken>, AppError> {
        let row = sqlx::query_as::<_, SingleUseTokenRow>(
            "SELECT * FROM password_reset_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(row.map(PasswordResetToken::from))
    }

    async fn mark_reset_token_used(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE password_reset_tokens SET is_used = TRUE, used_at = $2
            WHERE id = $1 AND is_used = FALSE AND superseded_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn invalidate_reset_tokens(
        &self,
        auth_identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE password_reset_tokens SET superseded_at = $2
            WHERE auth_identity_id = $1 AND is_used = FALSE AND superseded_at IS NULL
              AND expires_at >= $2
            "#,
        )
        .bind(auth_identity_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_reset_tokens_for_identity(
        &self,
        auth_identity_id: Uuid,
    ) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM password_reset_tokens WHERE auth_identity_id = $1")
            .bind(auth_identity_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_reset_tokens(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM password_reset_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

// ==================== Directory ====================

#[async_trait]
impl DirectoryRepository for Database {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, AppError> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(User::try_from)
            .transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE email = $1")
            .bind(normalize_username(email))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(User::try_from)
            .transpose()
    }

    async fn find_organization_by_id(&self, id: Uuid) -> Result<Option<Organization>, AppError> {
        let row = sqlx::query_as::<_, OrganizationRow>("SELECT * FROM organizations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.map(|row| Organization {
            id: row.id,
            name: row.name,
            owner_user_id: row.owner_user_id,
            created_at: row.created_at,
        }))
    }

    async fn list_memberships_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Membership>, AppError> {
        sqlx::query_as::<_, MembershipRow>(
            "SELECT * FROM memberships WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?
        .into_iter()
        .map(Membership::try_from)
        .collect()
    }

    async fn count_active_memberships(&self, user_id: Uuid) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM memberships WHERE user_id = $1 AND status = $2",
        )
        .bind(user_id)
        .bind(MembershipStatus::Active.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(count)
    }

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO invitations (
                id, organization_id, email, role, token_hash, status, expires_at,
                accepted_at, invited_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(invitation.id)
        .bind(invitation.organization_id)
        .bind(&invitation.email)
        .bind(invitation.role.as_str())
        .bind(&invitation.token_hash)
        .bind(invitation.status.as_str())
        .bind(invitation.expires_at)
        .bind(invitation.accepted_at)
        .bind(invitation.invited_by)
        .bind(invitation.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_invitation_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Invitation>, AppError> {
        sqlx::query_as::<_, InvitationRow>("SELECT * FROM invitations WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(Invitation::try_from)
            .transpose()
    }
}

// ==================== Billing ====================

#[async_trait]
impl BillingRepository for Database {
    async fn find_subscription_for_organization(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE organization_id = $1",
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            Ok(Subscription {
                id: row.id,
                organization_id: row.organization_id,
                plan_id: row.plan_id,
                status: decode(&row.status, SubscriptionStatus::from_code, "status")?,
                quantity: row.quantity,
                pending_quantity: row.pending_quantity,
                is_trial_active: row.is_trial_active,
            })
        })
        .transpose()
    }

    async fn find_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, AppError> {
        let row: Option<(Uuid, String, String)> =
            sqlx::query_as("SELECT id, name, tier FROM plans WHERE id = $1")
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        row.map(|(id, name, tier)| {
            Ok(Plan {
                id,
                name,
                tier: decode(&tier, PlanTier::from_code, "tier")?,
            })
        })
        .transpose()
    }

    async fn count_classes(&self, organization_id: Uuid) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM classes WHERE organization_id = $1")
                .bind(organization_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(count)
    }
}

// ==================== Saga log ====================

#[async_trait]
impl SagaLog for Database {
    async fn insert_saga(&self, saga: &SagaInstance) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO sagas (
                id, kind, step, status, username, auth_identity_id, error,
                compensation_attempts, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(saga.id)
        .bind(saga.kind.as_str())
        .bind(saga.step.as_str())
        .bind(saga.status.as_str())
        .bind(&saga.username)
        .bind(saga.auth_identity_id)
        .bind(&saga.error)
        .bind(saga.compensation_attempts)
        .bind(saga.version)
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_saga(&self, id: Uuid) -> Result<Option<SagaInstance>, AppError> {
        sqlx::query_as::<_, SagaRow>("SELECT * FROM sagas WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .map(SagaInstance::try_from)
            .transpose()
    }

    async fn update_saga(&self, saga: &mut SagaInstance) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE sagas SET
                step = $3, status = $4, auth_identity_id = $5, error = $6,
                compensation_attempts = $7, updated_at = $8, version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(saga.id)
        .bind(saga.version)
        .bind(saga.step.as_str())
        .bind(saga.status.as_str())
        .bind(saga.auth_identity_id)
        .bind(&saga.error)
        .bind(saga.compensation_attempts)
        .bind(saga.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Concurrent modification of saga {}",
                saga.id
            )));
        }

        saga.version += 1;
        Ok(())
    }

    async fn list_stalled_sagas(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<SagaInstance>, AppError> {
        sqlx::query_as::<_, SagaRow>(
            "SELECT * FROM sagas WHERE status = $1 AND updated_at < $2 ORDER BY updated_at",
        )
        .bind(SagaStatus::Compensating.as_str())
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?
        .into_iter()
        .map(SagaInstance::try_from)
        .collect()
    }
}

// ==================== Unit of work ====================

#[async_trait]
impl UnitOfWork for Database {
    async fn commit(&self, changes: ChangeSet, now: DateTime<Utc>) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        for user in &changes.users {
            sqlx::query(
                r#"
                INSERT INTO users (id, first_name, last_name, email, auth_identity_id, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(user.id)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.email)
            .bind(user.auth_identity_id)
            .bind(user.status.as_str())
            .bind(user.created_at)
            .bind(user.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        for organization in &changes.organizations {
            sqlx::query(
                "INSERT INTO organizations (id, name, owner_user_id, created_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(organization.id)
            .bind(&organization.name)
            .bind(organization.owner_user_id)
            .bind(organization.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        for membership in &changes.memberships {
            sqlx::query(
                r#"
                INSERT INTO memberships (id, user_id, organization_id, role, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(membership.id)
            .bind(membership.user_id)
            .bind(membership.organization_id)
            .bind(membership.role.as_str())
            .bind(membership.status.as_str())
            .bind(membership.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        for link in &changes.identity_links {
            let result = sqlx::query(
                r#"
                UPDATE auth_identities SET
                    user_id = $2,
                    is_email_verified = is_email_verified OR $3,
                    email_verified_at = CASE
                        WHEN $3 AND NOT is_email_verified THEN $4
                        ELSE email_verified_at
                    END,
                    updated_at = $4,
                    version = version + 1
                WHERE id = $1 AND user_id IS NULL
                "#,
            )
            .bind(link.auth_identity_id)
            .bind(link.user_id)
            .bind(link.mark_email_verified)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

            if result.rows_affected() == 0 {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Identity {} is missing or already linked",
                    link.auth_identity_id
                )));
            }
        }

        for acceptance in &changes.invitation_acceptances {
            let result = sqlx::query(
                "UPDATE invitations SET status = $2, accepted_at = $3 WHERE id = $1 AND status = $4",
            )
            .bind(acceptance.invitation_id)
            .bind(InvitationStatus::Accepted.as_str())
            .bind(now)
            .bind(InvitationStatus::Pending.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

            if result.rows_affected() == 0 {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Invitation {} is no longer pending",
                    acceptance.invitation_id
                )));
            }
        }

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use chrono::{Duration, SubsecRound};

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_refresh_token_usable_through_expiry_instant() {
        let pool = crate::db::connect(&DatabaseConfig {
            url: "postgres://localhost/provisioning_test".to_string(),
            max_connections: 2,
            min_connections: 1,
        })
        .await
        .unwrap();
        let database = Database::new(pool);

        // Postgres keeps microseconds.
        let now = Utc::now().trunc_subsecs(6);
        let token = RefreshToken::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            &crate::utils::token::generate_token(),
            Duration::days(7),
            Default::default(),
            now,
        );
        database.insert_refresh_token(&token).await.unwrap();

        let active = database
            .list_active_refresh_tokens(token.user_id, token.expires_at)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);

        database
            .delete_expired_refresh_tokens(token.expires_at)
            .await
            .unwrap();
        let active = database
            .list_active_refresh_tokens(token.user_id, token.expires_at)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
    }
}

//! Pluggable authentication providers.
//!
//! Every provider implements [`AuthStrategy`] against the credential store.
//! The provider in use is chosen once at startup from [`AuthProviderKind`];
//! sessions for all of them go through the shared [`SessionService`].

mod external;
mod local;
mod oauth;

pub use external::{
    ExternalIdpStrategy, ExternalRegistration, HttpIdentityProviderClient, IdentityProviderClient,
};
pub use local::LocalAuthStrategy;
pub use oauth::{GoogleOAuthClient, OAuthClient, OAuthProfile, OAuthStrategy};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::CredentialsConfig;
use crate::models::{AuthIdentity, AuthProvider, LoginFailure, UserStatus};
use crate::services::{
    ClientInfo, ErrorKind, PasswordPolicy, PolicyService, RefreshRequest, ServiceError,
    SessionService, SessionTokens,
};
use crate::store::Backends;
use crate::utils::{CredentialHasher, Password};

/// What the caller proves their identity with.
#[derive(Debug, Clone)]
pub enum Credential {
    Password(Password),
    AuthorizationCode {
        code: String,
        redirect_uri: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct SignUpRequest {
    pub email: String,
    pub credential: Credential,
    /// Mailbox ownership is already proven (an accepted invitation), so no
    /// verification token is issued.
    pub email_proven: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignUpResult {
    pub auth_identity_id: Uuid,
    /// Normalized email the identity was registered under.
    pub username: String,
    pub provider: AuthProvider,
    pub email_verified: bool,
    #[serde(skip_serializing)]
    pub verification_token: Option<String>,
    pub send_verification_token: bool,
}

#[derive(Debug, Clone)]
pub struct SignInRequest {
    pub username: String,
    pub credential: Credential,
    pub client: ClientInfo,
}

/// Local identities confirm with the emailed token; external ones with the
/// provider's code plus the username.
#[derive(Debug, Clone)]
pub struct ConfirmSignUpRequest {
    pub code: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationResult {
    pub username: String,
    /// Present when this service mails the code itself.
    #[serde(skip_serializing)]
    pub verification_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ForgotPasswordResult {
    /// None when no account matches; callers respond identically either way.
    pub reset_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConfirmForgotPasswordRequest {
    pub token: String,
    pub new_password: Password,
}

#[derive(Debug, Clone)]
pub struct ChangePasswordRequest {
    pub auth_identity_id: Uuid,
    pub current_password: Password,
    pub new_password: Password,
}

#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn provider(&self) -> AuthProvider;

    async fn sign_up(
        &self,
        request: &SignUpRequest,
        now: DateTime<Utc>,
    ) -> Result<SignUpResult, ServiceError>;

    async fn sign_in(
        &self,
        request: &SignInRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError>;

    async fn confirm_sign_up(
        &self,
        request: &ConfirmSignUpRequest,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError>;

    async fn resend_confirmation_code(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationResult, ServiceError>;

    async fn forgot_password(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<ForgotPasswordResult, ServiceError>;

    async fn confirm_forgot_password(
        &self,
        request: &ConfirmForgotPasswordRequest,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError>;

    async fn change_password(
        &self,
        request: &ChangePasswordRequest,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError>;

    /// Re-keys the identity to a new email; verification starts over.
    async fn change_username(
        &self,
        auth_identity_id: Uuid,
        new_username: &str,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationResult, ServiceError>;

    async fn refresh_token(
        &self,
        request: &RefreshRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError>;

    /// Removes the identity and its single-use tokens. False when it was
    /// already gone.
    async fn delete_identity(&self, auth_identity_id: Uuid) -> Result<bool, ServiceError>;
}

/// Which provider this deployment authenticates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthProviderKind {
    Local,
    ExternalIdp,
    Google,
}

impl std::str::FromStr for AuthProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(AuthProviderKind::Local),
            "external_idp" => Ok(AuthProviderKind::ExternalIdp),
            "google" => Ok(AuthProviderKind::Google),
            _ => Err(format!("Invalid auth provider: {}", s)),
        }
    }
}

/// Everything a strategy needs, assembled once at startup.
#[derive(Clone)]
pub struct StrategyDeps {
    pub backends: Backends,
    pub sessions: SessionService,
    pub hasher: CredentialHasher,
    pub credentials: CredentialsConfig,
    pub password_policy: PasswordPolicy,
    pub identity_provider: Option<Arc<dyn IdentityProviderClient>>,
    pub oauth: Option<Arc<dyn OAuthClient>>,
}

pub fn resolve_strategy(
    kind: AuthProviderKind,
    deps: StrategyDeps,
) -> Result<Arc<dyn AuthStrategy>, AppError> {
    let strategy: Arc<dyn AuthStrategy> = match kind {
        AuthProviderKind::Local => Arc::new(LocalAuthStrategy::new(deps)),
        AuthProviderKind::ExternalIdp => {
            let client = deps.identity_provider.clone().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "AUTH_PROVIDER=external_idp requires an identity provider client"
                ))
            })?;
            Arc::new(ExternalIdpStrategy::new(deps, client))
        }
        AuthProviderKind::Google => {
            let client = deps.oauth.clone().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "AUTH_PROVIDER=google requires an OAuth client"
                ))
            })?;
            Arc::new(OAuthStrategy::new(deps, client))
        }
    };

    tracing::info!(provider = strategy.provider().as_str(), "Auth strategy resolved");
    Ok(strategy)
}

// ==================== Shared steps ====================

pub(crate) fn invalid_credentials(message: impl Into<String>) -> ServiceError {
    ServiceError::domain(ErrorKind::InvalidCredentials, message)
}

pub(crate) fn method_not_supported(operation: &str, provider: AuthProvider) -> ServiceError {
    ServiceError::domain(
        ErrorKind::MethodNotSupported,
        format!("{} is not supported for {} accounts", operation, provider.as_str()),
    )
}

/// Bound on compare-and-swap retries for a single identity write.
const IDENTITY_WRITE_ATTEMPTS: usize = 10;

fn identity_contention(id: Uuid) -> ServiceError {
    ServiceError::Application(AppError::Conflict(anyhow::anyhow!(
        "Auth identity {} is being updated concurrently",
        id
    )))
}

fn locked_error(minutes: i64) -> ServiceError {
    ServiceError::domain(
        ErrorKind::AccountLocked,
        format!(
            "Account is locked due to too many failed login attempts. Try again in {} minute{}.",
            minutes,
            if minutes == 1 { "" } else { "s" }
        ),
    )
}

pub(crate) fn validate_new_password(
    password: &Password,
    policy: &PasswordPolicy,
) -> Result<(), ServiceError> {
    PolicyService::validate_password(password.as_str(), policy)
        .map_err(|e| ServiceError::domain(ErrorKind::WeakPassword, e.to_string()))
}

impl StrategyDeps {
    /// Lazy lock expiry. Persists the unlock when the lock has lapsed.
    pub(crate) async fn refresh_lock(
        &self,
        identity: &mut AuthIdentity,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        for _ in 0..IDENTITY_WRITE_ATTEMPTS {
            if !identity.refresh_lock_state(now) {
                return Ok(());
            }
            match self.backends.identities.update_identity(identity).await {
                Ok(()) => {
                    tracing::info!(auth_identity_id = %identity.id, "Account lock expired");
                    return Ok(());
                }
                Err(AppError::Conflict(_)) => *identity = self.reload_identity(identity.id).await?,
                Err(e) => return Err(e.into()),
            }
        }
        Err(identity_contention(identity.id))
    }

    pub(crate) fn ensure_unlocked(
        &self,
        identity: &AuthIdentity,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        if identity.is_locked_at(now) {
            return Err(locked_error(identity.remaining_lock_minutes(now)));
        }
        Ok(())
    }

    /// Count a failed attempt and build the error the caller should see.
    pub(crate) async fn register_failed_attempt(
        &self,
        identity: &mut AuthIdentity,
        now: DateTime<Utc>,
    ) -> Result<ServiceError, ServiceError> {
        let mut outcome = None;
        for _ in 0..IDENTITY_WRITE_ATTEMPTS {
            // A concurrent attempt may already have locked the account.
            if identity.is_locked_at(now) {
                return Ok(locked_error(identity.remaining_lock_minutes(now)));
            }
            let failure = identity.record_failed_login(
                now,
                self.credentials.max_failed_login_attempts,
                Duration::minutes(self.credentials.lockout_duration_minutes),
            );
            match self.backends.identities.update_identity(identity).await {
                Ok(()) => {
                    outcome = Some(failure);
                    break;
                }
                Err(AppError::Conflict(_)) => {
                    tracing::debug!(auth_identity_id = %identity.id, "Failed attempt raced, retrying");
                    *identity = self.reload_identity(identity.id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        let outcome = outcome.ok_or_else(|| identity_contention(identity.id))?;

        Ok(match outcome {
            LoginFailure::Remaining(remaining) => {
                tracing::info!(auth_identity_id = %identity.id, remaining, "Failed sign-in attempt");
                invalid_credentials(format!(
                    "Invalid email or password. {} attempt{} remaining before the account is locked.",
                    remaining,
                    if remaining == 1 { "" } else { "s" }
                ))
            }
            LoginFailure::Locked { until } => {
                tracing::warn!(
                    auth_identity_id = %identity.id,
                    locked_until = %until,
                    "Account locked after repeated failed sign-ins"
                );
                locked_error(identity.remaining_lock_minutes(now))
            }
        })
    }

    /// Latest stored state after a lost compare-and-swap.
    async fn reload_identity(&self, id: Uuid) -> Result<AuthIdentity, ServiceError> {
        self.backends
            .identities
            .find_identity_by_id(id)
            .await?
            .ok_or_else(|| invalid_credentials("Invalid email or password"))
    }

    /// Final step of every successful sign-in: account checks, counter
    /// reset, then a fresh session.
    pub(crate) async fn complete_sign_in(
        &self,
        identity: &mut AuthIdentity,
        client: &ClientInfo,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError> {
        let user_id = identity.user_id.ok_or_else(|| {
            ServiceError::domain(
                ErrorKind::AccountNotProvisioned,
                "Account setup has not completed. Please sign up again.",
            )
        })?;

        let user = self.backends.directory.find_user_by_id(user_id).await?;
        let user = match user {
            Some(user) if user.status != UserStatus::Deleted => user,
            _ => {
                return Err(ServiceError::domain(
                    ErrorKind::UserAccountDeleted,
                    "User account has been deleted",
                ))
            }
        };
        if user.status == UserStatus::Suspended {
            return Err(ServiceError::domain(
                ErrorKind::UserAccountSuspended,
                "User account is suspended",
            ));
        }

        identity.record_successful_login(now);
        self.backends.identities.update_identity(identity).await?;

        let tokens = self.sessions.issue_session(&user, identity, client, now).await?;
        tracing::info!(user_id = %user.id, provider = identity.provider.as_str(), "Signed in");
        Ok(tokens)
    }

    /// Drop an identity together with its single-use tokens.
    pub(crate) async fn remove_identity_records(
        &self,
        auth_identity_id: Uuid,
    ) -> Result<bool, ServiceError> {
        self.backends
            .verification_tokens
            .delete_verification_tokens_for_identity(auth_identity_id)
            .await?;
        self.backends
            .reset_tokens
            .delete_reset_tokens_for_identity(auth_identity_id)
            .await?;
        let deleted = self
            .backends
            .identities
            .delete_identity(auth_identity_id)
            .await?;

        if deleted {
            tracing::info!(auth_identity_id = %auth_identity_id, "Auth identity deleted");
        }
        Ok(deleted)
    }

    /// Insert a fresh identity; a unique-key race surfaces as a duplicate
    /// email rather than an infrastructure fault.
    pub(crate) async fn insert_new_identity(
        &self,
        identity: &AuthIdentity,
    ) -> Result<(), ServiceError> {
        match self.backends.identities.insert_identity(identity).await {
            Ok(()) => Ok(()),
            Err(AppError::Conflict(_)) => Err(email_already_exists()),
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) fn email_already_exists() -> ServiceError {
    ServiceError::domain(
        ErrorKind::EmailAlreadyExists,
        "An account with this email already exists",
    )
}

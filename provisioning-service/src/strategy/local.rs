use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{
    email_already_exists, invalid_credentials, method_not_supported, validate_new_password,
    AuthStrategy, ChangePasswordRequest, ConfirmForgotPasswordRequest, ConfirmSignUpRequest,
    ConfirmationResult, Credential, ForgotPasswordResult, SignInRequest, SignUpRequest,
    SignUpResult, StrategyDeps,
};
use crate::models::{
    normalize_username, AuthIdentity, AuthProvider, PasswordResetToken, VerificationToken,
};
use crate::services::{ErrorKind, RefreshRequest, ServiceError, SessionTokens};
use crate::utils::{generate_token, hash_token, Password, PasswordHashString};

/// Email + password accounts with hashes held in the credential store.
pub struct LocalAuthStrategy {
    deps: StrategyDeps,
}

impl LocalAuthStrategy {
    pub fn new(deps: StrategyDeps) -> Self {
        Self { deps }
    }

    fn password<'a>(&self, credential: &'a Credential, operation: &str) -> Result<&'a Password, ServiceError> {
        match credential {
            Credential::Password(password) => Ok(password),
            Credential::AuthorizationCode { .. } => {
                Err(method_not_supported(operation, AuthProvider::Local))
            }
        }
    }

    async fn find_identity(&self, username: &str) -> Result<Option<AuthIdentity>, ServiceError> {
        Ok(self
            .deps
            .backends
            .identities
            .find_identity_by_provider_and_username(AuthProvider::Local, username)
            .await?)
    }

    async fn load_identity(&self, auth_identity_id: Uuid) -> Result<AuthIdentity, ServiceError> {
        self.deps
            .backends
            .identities
            .find_identity_by_id(auth_identity_id)
            .await?
            .ok_or_else(identity_not_found)
    }

    async fn matches_current(
        &self,
        identity: &AuthIdentity,
        password: &Password,
    ) -> Result<bool, ServiceError> {
        match &identity.password_hash {
            Some(hash) => Ok(self
                .deps
                .hasher
                .verify(password, &PasswordHashString::new(hash.clone()))
                .await?),
            None => Ok(false),
        }
    }

    /// Expire outstanding verification tokens and issue a new one.
    async fn issue_verification_token(
        &self,
        auth_identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<String, ServiceError> {
        self.deps
            .backends
            .verification_tokens
            .invalidate_verification_tokens(auth_identity_id, now)
            .await?;

        let token = generate_token();
        let record = VerificationToken::new(
            auth_identity_id,
            &token,
            Duration::hours(self.deps.credentials.verification_token_ttl_hours),
            now,
        );
        self.deps
            .backends
            .verification_tokens
            .insert_verification_token(&record)
            .await?;
        Ok(token)
    }

    /// Store a new password hash and end every session of the linked user.
    async fn replace_password(
        &self,
        identity: &mut AuthIdentity,
        new_password: &Password,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let hash = self.deps.hasher.hash(new_password).await?;
        identity.set_password_hash(hash.into_string(), now);
        self.deps.backends.identities.update_identity(identity).await?;

        if let Some(user_id) = identity.user_id {
            self.deps.sessions.revoke_all(user_id, now).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuthStrategy for LocalAuthStrategy {
    fn provider(&self) -> AuthProvider {
        AuthProvider::Local
    }

    async fn sign_up(
        &self,
        request: &SignUpRequest,
        now: DateTime<Utc>,
    ) -> Result<SignUpResult, ServiceError> {
        let password = self.password(&request.credential, "Sign-up without a password")?;
        let username = normalize_username(&request.email);

        if self
            .deps
            .backends
            .identities
            .find_identity_by_username(&username)
            .await?
            .is_some()
        {
            return Err(email_already_exists());
        }

        validate_new_password(password, &self.deps.password_policy)?;

        let hash = self.deps.hasher.hash(password).await?;
        let identity = AuthIdentity::new(
            AuthProvider::Local,
            username.clone(),
            &username,
            Some(hash.into_string()),
            now,
        );
        self.deps.insert_new_identity(&identity).await?;

        let token = if request.email_proven {
            None
        } else {
            Some(self.issue_verification_token(identity.id, now).await?)
        };

        tracing::info!(auth_identity_id = %identity.id, "Local identity created");
        Ok(SignUpResult {
            auth_identity_id: identity.id,
            username,
            provider: AuthProvider::Local,
            email_verified: false,
            send_verification_token: token.is_some(),
            verification_token: token,
        })
    }

    async fn sign_in(
        &self,
        request: &SignInRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError> {
        let password = self.password(&request.credential, "Sign-in without a password")?;

        let mut identity = self
            .find_identity(&request.username)
            .await?
            .ok_or_else(|| invalid_credentials("Invalid email or password"))?;

        self.deps.refresh_lock(&mut identity, now).await?;

        if !identity.is_email_verified {
            return Err(ServiceError::domain(
                ErrorKind::EmailNotVerified,
                "Please verify your email address before signing in",
            ));
        }

        self.deps.ensure_unlocked(&identity, now)?;

        if !self.matches_current(&identity, password).await? {
            return Err(self.deps.register_failed_attempt(&mut identity, now).await?);
        }

        self.deps
            .complete_sign_in(&mut identity, &request.client, now)
            .await
    }

    async fn confirm_sign_up(
        &self,
        request: &ConfirmSignUpRequest,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let tokens = &self.deps.backends.verification_tokens;

        let token = tokens
            .find_verification_token_by_hash(&hash_token(&request.code))
            .await?
            .ok_or_else(|| {
                ServiceError::domain(
                    ErrorKind::InvalidVerificationToken,
                    "Invalid verification token",
                )
            })?;

        if token.is_used {
            return Err(token_already_used());
        }
        // Replaced tokens report as expired.
        if token.is_superseded() || token.is_expired(now) {
            return Err(ServiceError::domain(
                ErrorKind::VerificationTokenExpired,
                "Verification token has expired. Please request a new one.",
            ));
        }

        let mut identity = self.load_identity(token.auth_identity_id).await?;
        if identity.is_email_verified {
            return Err(ServiceError::domain(
                ErrorKind::EmailAlreadyVerified,
                "Email address is already verified",
            ));
        }

        if !tokens.mark_verification_token_used(token.id, now).await? {
            return Err(token_already_used());
        }

        identity.mark_email_verified(now);
        self.deps.backends.identities.update_identity(&mut identity).await?;

        tracing::info!(auth_identity_id = %identity.id, "Email verified");
        Ok(())
    }

    async fn resend_confirmation_code(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationResult, ServiceError> {
        let identity = self
            .find_identity(username)
            .await?
            .ok_or_else(identity_not_found)?;

        if identity.is_email_verified {
            return Err(ServiceError::domain(
                ErrorKind::EmailAlreadyVerified,
                "Email address is already verified",
            ));
        }

        let token = self.issue_verification_token(identity.id, now).await?;
        Ok(ConfirmationResult {
            username: identity.username,
            verification_token: Some(token),
        })
    }

    async fn forgot_password(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<ForgotPasswordResult, ServiceError> {
        let Some(identity) = self.find_identity(username).await? else {
            tracing::info!("Password reset requested for unknown account");
            return Ok(ForgotPasswordResult::default());
        };

        let reset_tokens = &self.deps.backends.reset_tokens;
        reset_tokens.invalidate_reset_tokens(identity.id, now).await?;

        let token = generate_token();
        let record = PasswordResetToken::new(
            identity.id,
            &token,
            Duration::minutes(self.deps.credentials.password_reset_token_ttl_minutes),
            now,
        );
        reset_tokens.insert_reset_token(&record).await?;

        tracing::info!(auth_identity_id = %identity.id, "Password reset token issued");
        Ok(ForgotPasswordResult {
            reset_token: Some(token),
        })
    }

    async fn confirm_forgot_password(
        &self,
        request: &ConfirmForgotPasswordRequest,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let reset_tokens = &self.deps.backends.reset_tokens;

        let token = reset_tokens
            .find_reset_token_by_hash(&hash_token(&request.token))
            .await?
            .ok_or_else(|| {
                ServiceError::domain(ErrorKind::InvalidResetToken, "Invalid password reset token")
            })?;

        if token.is_used {
            return Err(token_already_used());
        }
        // Replaced tokens report as expired.
        if token.is_superseded() || token.is_expired(now) {
            return Err(ServiceError::domain(
                ErrorKind::ResetTokenExpired,
                "Password reset token has expired. Please request a new one.",
            ));
        }

        validate_new_password(&request.new_password, &self.deps.password_policy)?;

        let mut identity = self.load_identity(token.auth_identity_id).await?;
        if self.matches_current(&identity, &request.new_password).await? {
            return Err(password_reuse());
        }

        if !reset_tokens.mark_reset_token_used(token.id, now).await? {
            return Err(token_already_used());
        }

        self.replace_password(&mut identity, &request.new_password, now)
            .await?;

        tracing::info!(auth_identity_id = %identity.id, "Password reset completed");
        Ok(())
    }

    async fn change_password(
        &self,
        request: &ChangePasswordRequest,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut identity = self.load_identity(request.auth_identity_id).await?;

        if !self
            .matches_current(&identity, &request.current_password)
            .await?
        {
            return Err(invalid_credentials("Current password is incorrect"));
        }

        validate_new_password(&request.new_password, &self.deps.password_policy)?;

        if request.new_password.as_str() == request.current_password.as_str() {
            return Err(password_reuse());
        }

        self.replace_password(&mut identity, &request.new_password, now)
            .await?;

        tracing::info!(auth_identity_id = %identity.id, "Password changed");
        Ok(())
    }

    async fn change_username(
        &self,
        auth_identity_id: Uuid,
        new_username: &str,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationResult, ServiceError> {
        let mut identity = self.load_identity(auth_identity_id).await?;
        let username = normalize_username(new_username);

        if username == identity.username {
            return Ok(ConfirmationResult {
                username,
                verification_token: None,
            });
        }

        if self
            .deps
            .backends
            .identities
            .find_identity_by_username(&username)
            .await?
            .is_some()
        {
            return Err(email_already_exists());
        }

        identity.change_username(&username, now);
        self.deps
            .backends
            .identities
            .update_identity(&mut identity)
            .await?;

        let token = self.issue_verification_token(identity.id, now).await?;

        tracing::info!(auth_identity_id = %identity.id, "Username changed");
        Ok(ConfirmationResult {
            username: identity.username,
            verification_token: Some(token),
        })
    }

    async fn refresh_token(
        &self,
        request: &RefreshRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError> {
        self.deps.sessions.rotate(request, now).await
    }

    async fn delete_identity(&self, auth_identity_id: Uuid) -> Result<bool, ServiceError> {
        self.deps.remove_identity_records(auth_identity_id).await
    }
}

fn identity_not_found() -> ServiceError {
    ServiceError::domain(ErrorKind::IdentityNotFound, "Account not found")
}

fn token_already_used() -> ServiceError {
    ServiceError::domain(ErrorKind::TokenAlreadyUsed, "Token has already been used")
}

fn password_reuse() -> ServiceError {
    ServiceError::domain(
        ErrorKind::PasswordReuse,
        "New password must be different from the current password",
    )
}

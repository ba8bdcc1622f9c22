//! Sign-in with an OAuth provider (Google).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    email_already_exists, invalid_credentials, AuthStrategy, ChangePasswordRequest,
    ConfirmForgotPasswordRequest, ConfirmSignUpRequest, ConfirmationResult, Credential,
    ForgotPasswordResult, SignInRequest, SignUpRequest, SignUpResult, StrategyDeps,
};
use crate::config::GoogleOAuthConfig;
use crate::models::{normalize_username, AuthIdentity, AuthProvider};
use crate::services::{ErrorKind, RefreshRequest, ServiceError, SessionTokens};

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Verified profile returned by the provider after a code exchange.
#[derive(Debug, Clone)]
pub struct OAuthProfile {
    pub subject: String,
    pub email: String,
    pub email_verified: bool,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
}

#[async_trait]
pub trait OAuthClient: Send + Sync {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> Result<OAuthProfile, ServiceError>;
}

pub struct OAuthStrategy {
    deps: StrategyDeps,
    client: Arc<dyn OAuthClient>,
}

impl OAuthStrategy {
    pub fn new(deps: StrategyDeps, client: Arc<dyn OAuthClient>) -> Self {
        Self { deps, client }
    }

    async fn verified_profile(&self, credential: &Credential) -> Result<OAuthProfile, ServiceError> {
        let Credential::AuthorizationCode { code, redirect_uri } = credential else {
            return Err(password_operations_not_allowed());
        };

        let profile = self
            .client
            .exchange_code(code, redirect_uri.as_deref())
            .await?;

        if !profile.email_verified {
            return Err(ServiceError::domain(
                ErrorKind::EmailNotVerified,
                "The provider has not verified this email address",
            ));
        }
        Ok(profile)
    }

    async fn find_by_subject(&self, subject: &str) -> Result<Option<AuthIdentity>, ServiceError> {
        Ok(self
            .deps
            .backends
            .identities
            .find_identity_by_provider_user_id(AuthProvider::Google, subject)
            .await?)
    }
}

#[async_trait]
impl AuthStrategy for OAuthStrategy {
    fn provider(&self) -> AuthProvider {
        AuthProvider::Google
    }

    async fn sign_up(
        &self,
        request: &SignUpRequest,
        now: DateTime<Utc>,
    ) -> Result<SignUpResult, ServiceError> {
        let profile = self.verified_profile(&request.credential).await?;
        let username = normalize_username(&profile.email);

        let identity = match self.find_by_subject(&profile.subject).await? {
            // Already provisioned through an earlier sign-up.
            Some(existing) if existing.user_id.is_some() => return Err(email_already_exists()),
            // Left over from a sign-up whose later steps failed; reuse it.
            Some(existing) => existing,
            None => {
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

                let mut identity = AuthIdentity::new(
                    AuthProvider::Google,
                    profile.subject.clone(),
                    &username,
                    None,
                    now,
                );
                identity.mark_email_verified(now);
                self.deps.insert_new_identity(&identity).await?;
                tracing::info!(auth_identity_id = %identity.id, "OAuth identity created");
                identity
            }
        };

        Ok(SignUpResult {
            auth_identity_id: identity.id,
            username: identity.username,
            provider: AuthProvider::Google,
            email_verified: true,
            verification_token: None,
            send_verification_token: false,
        })
    }

    async fn sign_in(
        &self,
        request: &SignInRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError> {
        let profile = self.verified_profile(&request.credential).await?;

        let mut identity = self
            .find_by_subject(&profile.subject)
            .await?
            .ok_or_else(|| {
                ServiceError::domain(
                    ErrorKind::AccountNotProvisioned,
                    "No account is registered for this Google profile. Please sign up first.",
                )
            })?;

        self.deps.refresh_lock(&mut identity, now).await?;
        self.deps.ensure_unlocked(&identity, now)?;

        self.deps
            .complete_sign_in(&mut identity, &request.client, now)
            .await
    }

    async fn confirm_sign_up(
        &self,
        _request: &ConfirmSignUpRequest,
        _now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        Err(super::method_not_supported("Email confirmation", AuthProvider::Google))
    }

    async fn resend_confirmation_code(
        &self,
        _username: &str,
        _now: DateTime<Utc>,
    ) -> Result<ConfirmationResult, ServiceError> {
        Err(super::method_not_supported("Email confirmation", AuthProvider::Google))
    }

    async fn forgot_password(
        &self,
        _username: &str,
        _now: DateTime<Utc>,
    ) -> Result<ForgotPasswordResult, ServiceError> {
        Err(password_operations_not_allowed())
    }

    async fn confirm_forgot_password(
        &self,
        _request: &ConfirmForgotPasswordRequest,
        _now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        Err(password_operations_not_allowed())
    }

    async fn change_password(
        &self,
        _request: &ChangePasswordRequest,
        _now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        Err(password_operations_not_allowed())
    }

    async fn change_username(
        &self,
        _auth_identity_id: Uuid,
        _new_username: &str,
        _now: DateTime<Utc>,
    ) -> Result<ConfirmationResult, ServiceError> {
        Err(super::method_not_supported("Username change", AuthProvider::Google))
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

fn password_operations_not_allowed() -> ServiceError {
    ServiceError::domain(
        ErrorKind::PasswordOperationsNotAllowed,
        "This account signs in with Google and has no password",
    )
}

// ==================== Google client ====================

#[derive(Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GoogleUserInfo {
    id: String,
    email: String,
    verified_email: bool,
    given_name: Option<String>,
    family_name: Option<String>,
}

#[derive(Clone)]
pub struct GoogleOAuthClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl GoogleOAuthClient {
    pub fn new(config: &GoogleOAuthConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
        }
    }
}

fn upstream_failure(context: &str, e: reqwest::Error) -> ServiceError {
    tracing::error!(error = %e, "{}", context);
    ServiceError::Application(AppError::BadGateway(format!("{}: {}", context, e)))
}

#[async_trait]
impl OAuthClient for GoogleOAuthClient {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> Result<OAuthProfile, ServiceError> {
        let redirect_uri = redirect_uri.unwrap_or(&self.redirect_uri);

        let token_res = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await
            .map_err(|e| upstream_failure("Failed to exchange Google code", e))?;

        if !token_res.status().is_success() {
            let status = token_res.status();
            let body = token_res.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Google token exchange rejected");
            return Err(invalid_credentials(
                "Authorization code is invalid or has expired",
            ));
        }

        let token: GoogleTokenResponse = token_res
            .json()
            .await
            .map_err(|e| upstream_failure("Failed to parse Google token response", e))?;

        let info: GoogleUserInfo = self
            .http
            .get(GOOGLE_USERINFO_URL)
            .bearer_auth(token.access_token)
            .send()
            .await
            .map_err(|e| upstream_failure("Failed to fetch Google user info", e))?
            .error_for_status()
            .map_err(|e| upstream_failure("Google user info request failed", e))?
            .json()
            .await
            .map_err(|e| upstream_failure("Failed to parse Google user info", e))?;

        Ok(OAuthProfile {
            subject: info.id,
            email: info.email,
            email_verified: info.verified_email,
            given_name: info.given_name,
            family_name: info.family_name,
        })
    }
}

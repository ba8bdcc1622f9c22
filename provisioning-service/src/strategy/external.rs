//! Accounts whose passwords live in an external identity provider.
//!
//! The provider owns registration, confirmation codes and password checks.
//! Lockout, linking and sessions stay local.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{
    email_already_exists, invalid_credentials, method_not_supported, AuthStrategy,
    ChangePasswordRequest, ConfirmForgotPasswordRequest, ConfirmSignUpRequest, ConfirmationResult,
    Credential, ForgotPasswordResult, SignInRequest, SignUpRequest, SignUpResult, StrategyDeps,
};
use crate::config::ExternalIdpConfig;
use crate::models::{normalize_username, AuthIdentity, AuthProvider};
use crate::services::{ErrorKind, RefreshRequest, ServiceError, SessionTokens};
use crate::utils::Password;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRegistration {
    /// Provider-side user id.
    pub subject: String,
    /// Whether the provider already considers the email confirmed.
    #[serde(default)]
    pub confirmed: bool,
}

#[async_trait]
pub trait IdentityProviderClient: Send + Sync {
    async fn register(
        &self,
        username: &str,
        password: &Password,
    ) -> Result<ExternalRegistration, ServiceError>;

    async fn confirm_registration(&self, username: &str, code: &str) -> Result<(), ServiceError>;

    /// Ok(false) when the provider rejects the password.
    async fn authenticate(&self, username: &str, password: &Password)
        -> Result<bool, ServiceError>;

    async fn resend_confirmation(&self, username: &str) -> Result<(), ServiceError>;

    /// Removing an unknown subject is not an error.
    async fn remove_user(&self, subject: &str) -> Result<(), ServiceError>;
}

pub struct ExternalIdpStrategy {
    deps: StrategyDeps,
    client: Arc<dyn IdentityProviderClient>,
}

impl ExternalIdpStrategy {
    pub fn new(deps: StrategyDeps, client: Arc<dyn IdentityProviderClient>) -> Self {
        Self { deps, client }
    }

    async fn find_identity(&self, username: &str) -> Result<Option<AuthIdentity>, ServiceError> {
        Ok(self
            .deps
            .backends
            .identities
            .find_identity_by_provider_and_username(AuthProvider::ExternalIdp, username)
            .await?)
    }

    fn unsupported(operation: &str) -> ServiceError {
        method_not_supported(operation, AuthProvider::ExternalIdp)
    }
}

#[async_trait]
impl AuthStrategy for ExternalIdpStrategy {
    fn provider(&self) -> AuthProvider {
        AuthProvider::ExternalIdp
    }

    async fn sign_up(
        &self,
        request: &SignUpRequest,
        now: DateTime<Utc>,
    ) -> Result<SignUpResult, ServiceError> {
        let Credential::Password(password) = &request.credential else {
            return Err(Self::unsupported("Sign-up without a password"));
        };
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

        let registration = self.client.register(&username, password).await?;

        let mut identity = AuthIdentity::new(
            AuthProvider::ExternalIdp,
            registration.subject.clone(),
            &username,
            None,
            now,
        );
        if registration.confirmed {
            identity.mark_email_verified(now);
        }

        if let Err(e) = self.deps.insert_new_identity(&identity).await {
            // Keep the provider in step with the local store.
            if let Err(cleanup) = self.client.remove_user(&registration.subject).await {
                tracing::error!(
                    error = %cleanup,
                    subject = %registration.subject,
                    "Failed to remove provider account after local insert failed"
                );
            }
            return Err(e);
        }

        tracing::info!(auth_identity_id = %identity.id, "External identity created");
        Ok(SignUpResult {
            auth_identity_id: identity.id,
            username,
            provider: AuthProvider::ExternalIdp,
            email_verified: registration.confirmed,
            verification_token: None,
            // The provider mails its own confirmation code.
            send_verification_token: false,
        })
    }

    async fn sign_in(
        &self,
        request: &SignInRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError> {
        let Credential::Password(password) = &request.credential else {
            return Err(Self::unsupported("Sign-in without a password"));
        };

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

        if !self.client.authenticate(&identity.username, password).await? {
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
        let username = request.username.as_deref().ok_or_else(|| {
            ServiceError::domain(
                ErrorKind::ValidationFailed,
                "Email is required to confirm an external account",
            )
        })?;

        let mut identity = self.find_identity(username).await?.ok_or_else(|| {
            ServiceError::domain(ErrorKind::IdentityNotFound, "Account not found")
        })?;

        if identity.is_email_verified {
            return Err(ServiceError::domain(
                ErrorKind::EmailAlreadyVerified,
                "Email address is already verified",
            ));
        }

        self.client
            .confirm_registration(&identity.username, &request.code)
            .await?;

        identity.mark_email_verified(now);
        self.deps
            .backends
            .identities
            .update_identity(&mut identity)
            .await?;

        tracing::info!(auth_identity_id = %identity.id, "External email confirmed");
        Ok(())
    }

    async fn resend_confirmation_code(
        &self,
        username: &str,
        _now: DateTime<Utc>,
    ) -> Result<ConfirmationResult, ServiceError> {
        let identity = self.find_identity(username).await?.ok_or_else(|| {
            ServiceError::domain(ErrorKind::IdentityNotFound, "Account not found")
        })?;

        if identity.is_email_verified {
            return Err(ServiceError::domain(
                ErrorKind::EmailAlreadyVerified,
                "Email address is already verified",
            ));
        }

        self.client.resend_confirmation(&identity.username).await?;
        Ok(ConfirmationResult {
            username: identity.username,
            verification_token: None,
        })
    }

    async fn forgot_password(
        &self,
        _username: &str,
        _now: DateTime<Utc>,
    ) -> Result<ForgotPasswordResult, ServiceError> {
        Err(Self::unsupported("Password reset"))
    }

    async fn confirm_forgot_password(
        &self,
        _request: &ConfirmForgotPasswordRequest,
        _now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        Err(Self::unsupported("Password reset"))
    }

    async fn change_password(
        &self,
        _request: &ChangePasswordRequest,
        _now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        Err(Self::unsupported("Password change"))
    }

    async fn change_username(
        &self,
        _auth_identity_id: Uuid,
        _new_username: &str,
        _now: DateTime<Utc>,
    ) -> Result<ConfirmationResult, ServiceError> {
        Err(Self::unsupported("Username change"))
    }

    async fn refresh_token(
        &self,
        request: &RefreshRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError> {
        self.deps.sessions.rotate(request, now).await
    }

    async fn delete_identity(&self, auth_identity_id: Uuid) -> Result<bool, ServiceError> {
        let Some(identity) = self
            .deps
            .backends
            .identities
            .find_identity_by_id(auth_identity_id)
            .await?
        else {
            return Ok(false);
        };

        self.client.remove_user(&identity.provider_user_id).await?;
        self.deps.remove_identity_records(identity.id).await
    }
}

// ==================== HTTP client ====================

#[derive(Serialize)]
struct CredentialsBody<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct ConfirmBody<'a> {
    username: &'a str,
    code: &'a str,
}

#[derive(Serialize)]
struct UsernameBody<'a> {
    username: &'a str,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// JSON-over-HTTP identity provider.
#[derive(Clone)]
pub struct HttpIdentityProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpIdentityProviderClient {
    pub fn new(config: &ExternalIdpConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ServiceError> {
        request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Identity provider request failed");
                if e.is_timeout() || e.is_connect() {
                    ServiceError::Application(AppError::ServiceUnavailable)
                } else {
                    ServiceError::Application(AppError::BadGateway(e.to_string()))
                }
            })
    }
}

async fn provider_message(response: reqwest::Response) -> String {
    let status = response.status();
    response
        .json::<ProviderErrorBody>()
        .await
        .ok()
        .and_then(|body| body.message)
        .unwrap_or_else(|| format!("Identity provider responded with {}", status))
}

fn unexpected_status(status: StatusCode, operation: &str) -> ServiceError {
    tracing::error!(status = %status, operation, "Unexpected identity provider response");
    ServiceError::Application(AppError::BadGateway(format!(
        "Identity provider {} failed with {}",
        operation, status
    )))
}

#[async_trait]
impl IdentityProviderClient for HttpIdentityProviderClient {
    async fn register(
        &self,
        username: &str,
        password: &Password,
    ) -> Result<ExternalRegistration, ServiceError> {
        let response = self
            .send(self.http.post(self.url("/users")).json(&CredentialsBody {
                username,
                password: password.as_str(),
            }))
            .await?;

        match response.status() {
            status if status.is_success() => response.json().await.map_err(|e| {
                ServiceError::Application(AppError::BadGateway(format!(
                    "Malformed identity provider response: {}",
                    e
                )))
            }),
            StatusCode::CONFLICT => Err(email_already_exists()),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Err(
                ServiceError::domain(ErrorKind::WeakPassword, provider_message(response).await),
            ),
            status => Err(unexpected_status(status, "registration")),
        }
    }

    async fn confirm_registration(&self, username: &str, code: &str) -> Result<(), ServiceError> {
        let response = self
            .send(
                self.http
                    .post(self.url("/users/confirm"))
                    .json(&ConfirmBody { username, code }),
            )
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => Err(ServiceError::domain(
                ErrorKind::InvalidVerificationToken,
                "Invalid confirmation code",
            )),
            StatusCode::GONE => Err(ServiceError::domain(
                ErrorKind::VerificationTokenExpired,
                "Confirmation code has expired. Please request a new one.",
            )),
            status => Err(unexpected_status(status, "confirmation")),
        }
    }

    async fn authenticate(
        &self,
        username: &str,
        password: &Password,
    ) -> Result<bool, ServiceError> {
        let response = self
            .send(self.http.post(self.url("/sessions")).json(&CredentialsBody {
                username,
                password: password.as_str(),
            }))
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED => Ok(false),
            StatusCode::FORBIDDEN => Err(ServiceError::domain(
                ErrorKind::EmailNotVerified,
                "Please verify your email address before signing in",
            )),
            status => Err(unexpected_status(status, "authentication")),
        }
    }

    async fn resend_confirmation(&self, username: &str) -> Result<(), ServiceError> {
        let response = self
            .send(
                self.http
                    .post(self.url("/users/confirm/resend"))
                    .json(&UsernameBody { username }),
            )
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ServiceError::domain(
                ErrorKind::IdentityNotFound,
                "Account not found",
            )),
            status => Err(unexpected_status(status, "resend")),
        }
    }

    async fn remove_user(&self, subject: &str) -> Result<(), ServiceError> {
        let response = self
            .send(self.http.delete(self.url(&format!("/users/{}", subject))))
            .await?;

        match response.status() {
            status if status.is_success() || status == StatusCode::NOT_FOUND => Ok(()),
            status => Err(unexpected_status(status, "removal")),
        }
    }
}

//! Provisioning sagas: identity first, then the user-side aggregates in one
//! unit of work, with compensation events when a later step fails.
//!
//! Each run is recorded in the saga log. The log is written before the
//! identity exists; after that, log write failures are reported but never
//! change the outcome returned to the caller.

mod invitation;
mod signup;

pub use invitation::{InvitationSignUpData, InvitationSignUpOutcome, InvitationSignUpSaga};
pub use signup::{SignUpData, SignUpOutcome, SignUpSaga};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use validator::{ValidateEmail, ValidationErrors};

use crate::events::{AuthIdentityFailed, DomainEvent, EventBus, UserFailed};
use crate::models::{SagaInstance, SagaStep};
use crate::services::{ErrorKind, PasswordPolicy, ServiceError};
use crate::store::Backends;
use crate::strategy::{
    validate_new_password, AuthStrategy, Credential, SignUpRequest, SignUpResult,
};

/// Collaborators shared by both sagas.
#[derive(Clone)]
pub struct SagaDeps {
    pub backends: Backends,
    pub strategy: Arc<dyn AuthStrategy>,
    pub events: Arc<dyn EventBus>,
    pub password_policy: PasswordPolicy,
    /// Prefix for links mailed to users.
    pub public_base_url: String,
}

impl SagaDeps {
    pub(crate) fn verification_link(&self, token: &str) -> String {
        format!(
            "{}/auth/verify?token={}",
            self.public_base_url.trim_end_matches('/'),
            token
        )
    }

    /// Persist a saga transition. Failures are logged only.
    pub(crate) async fn record(&self, saga: &mut SagaInstance) {
        if let Err(e) = self.backends.sagas.update_saga(saga).await {
            tracing::error!(
                saga_id = %saga.id,
                step = saga.step.as_str(),
                status = saga.status.as_str(),
                error = %e,
                "Failed to record saga transition"
            );
        }
    }

    /// Fire and forget. A lost compensation event is picked up again by
    /// maintenance from the saga log.
    pub(crate) async fn emit(&self, event: DomainEvent) {
        let name = event.name();
        let saga_id = event.saga_id();
        if let Err(e) = self.events.publish(event).await {
            tracing::error!(event = %name, saga_id = %saga_id, error = %e, "Failed to publish event");
        }
    }

    /// Run the strategy's sign-up as the saga's first step.
    ///
    /// A business-rule rejection leaves nothing behind, so the saga just
    /// fails. Anything else may have left a half-written identity, so
    /// compensation is requested.
    pub(crate) async fn create_identity(
        &self,
        saga: &mut SagaInstance,
        email: &str,
        credential: &Credential,
        email_proven: bool,
        now: DateTime<Utc>,
    ) -> Result<SignUpResult, ServiceError> {
        let request = SignUpRequest {
            email: email.to_string(),
            credential: credential.clone(),
            email_proven,
        };

        match self.strategy.sign_up(&request, now).await {
            Ok(result) => {
                saga.username = result.username.clone();
                saga.identity_created(result.auth_identity_id, now);
                self.record(saga).await;
                Ok(result)
            }
            Err(e) if e.is_domain() => {
                tracing::info!(saga_id = %saga.id, code = e.code(), "Sign-up rejected");
                saga.fail(SagaStep::IdentityCreateFailed, e.to_string(), now);
                self.record(saga).await;
                Err(e)
            }
            Err(e) => {
                tracing::error!(saga_id = %saga.id, error = %e, "Identity creation failed");
                saga.begin_compensation(SagaStep::IdentityCreateFailed, e.to_string(), now);
                self.record(saga).await;
                self.emit(DomainEvent::AuthIdentityFailed(AuthIdentityFailed {
                    saga_id: saga.id,
                    username: saga.username.clone(),
                }))
                .await;
                Err(e)
            }
        }
    }

    /// The user step failed after the identity was committed.
    pub(crate) async fn user_step_failed(
        &self,
        saga: &mut SagaInstance,
        identity: &SignUpResult,
        error: &ServiceError,
        now: DateTime<Utc>,
    ) {
        tracing::error!(
            saga_id = %saga.id,
            auth_identity_id = %identity.auth_identity_id,
            error = %error,
            "User step failed, compensating"
        );
        saga.begin_compensation(SagaStep::UserCreateFailed, error.to_string(), now);
        self.record(saga).await;
        self.emit(DomainEvent::UserFailed(UserFailed {
            saga_id: saga.id,
            username: identity.username.clone(),
            auth_identity_id: identity.auth_identity_id,
        }))
        .await;
    }
}

/// Input checks shared by both sagas: names via the derive, email shape and
/// password policy when the caller supplies a password.
pub(crate) fn validate_credential_input(
    email: &str,
    credential: &Credential,
    policy: &PasswordPolicy,
) -> Result<(), ServiceError> {
    let Credential::Password(password) = credential else {
        return Ok(());
    };

    if !email.trim().validate_email() {
        return Err(ServiceError::domain(
            ErrorKind::ValidationFailed,
            "email: must be a valid email address",
        ));
    }

    validate_new_password(password, policy)
}

pub(crate) fn validation_failed(errors: ValidationErrors) -> ServiceError {
    let mut fields: Vec<String> = errors
        .field_errors()
        .into_iter()
        .map(|(field, errs)| {
            let reason = errs
                .first()
                .and_then(|e| e.message.as_ref())
                .map(|m| m.to_string())
                .unwrap_or_else(|| "is invalid".to_string());
            format!("{}: {}", field, reason)
        })
        .collect();
    fields.sort();

    ServiceError::domain(ErrorKind::ValidationFailed, fields.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Password;

    #[test]
    fn test_email_checked_only_for_password_credentials() {
        let policy = PasswordPolicy::default();
        let password = Credential::Password(Password::new("Tr0ub4dor&Zx"));

        let err = validate_credential_input("not-an-email", &password, &policy).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ValidationFailed));

        let code = Credential::AuthorizationCode {
            code: "abc".into(),
            redirect_uri: None,
        };
        assert!(validate_credential_input("", &code, &policy).is_ok());
    }

    #[test]
    fn test_weak_password_reported_as_weak() {
        let policy = PasswordPolicy::default();
        let err = validate_credential_input(
            "ada@example.com",
            &Credential::Password(Password::new("short")),
            &policy,
        )
        .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::WeakPassword));
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use super::{validate_credential_input, validation_failed, SagaDeps};
use crate::events::{AuthIdentityCreated, DomainEvent, SignUpSucceeded};
use crate::models::{
    normalize_username, Membership, MembershipRole, Organization, SagaInstance, SagaKind,
    SagaStep, User,
};
use crate::services::ServiceError;
use crate::store::{ChangeSet, IdentityLink};
use crate::strategy::Credential;
use crate::utils::validation::validate_person_name;

#[derive(Debug, Clone, Validate)]
pub struct SignUpData {
    #[validate(custom(function = "validate_person_name"))]
    pub first_name: String,
    #[validate(custom(function = "validate_person_name"))]
    pub last_name: String,
    pub email: String,
    pub credential: Credential,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignUpOutcome {
    pub saga_id: Uuid,
    pub auth_identity_id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub username: String,
    pub email_verified: bool,
    #[serde(skip_serializing)]
    pub verification_token: Option<String>,
    pub send_verification_token: bool,
}

/// Self-service sign-up: identity, then user + organization + owner
/// membership in one commit.
#[derive(Clone)]
pub struct SignUpSaga {
    deps: SagaDeps,
}

impl SignUpSaga {
    pub fn new(deps: SagaDeps) -> Self {
        Self { deps }
    }

    #[instrument(
        skip(self, data, now),
        fields(saga = "sign_up", provider = self.deps.strategy.provider().as_str())
    )]
    pub async fn execute(
        &self,
        data: SignUpData,
        now: DateTime<Utc>,
    ) -> Result<SignUpOutcome, ServiceError> {
        data.validate().map_err(validation_failed)?;
        validate_credential_input(&data.email, &data.credential, &self.deps.password_policy)?;

        let mut saga = SagaInstance::start(SagaKind::SignUp, &normalize_username(&data.email), now);
        self.deps.backends.sagas.insert_saga(&saga).await?;
        tracing::info!(saga_id = %saga.id, "Sign-up saga started");

        let identity = self
            .deps
            .create_identity(&mut saga, &data.email, &data.credential, false, now)
            .await?;

        self.deps
            .emit(DomainEvent::AuthIdentityCreated(AuthIdentityCreated {
                saga_id: saga.id,
                auth_identity_id: identity.auth_identity_id,
                username: identity.username.clone(),
                provider: identity.provider,
                first_name: data.first_name.trim().to_string(),
                last_name: data.last_name.trim().to_string(),
                send_verification_token: identity.send_verification_token,
            }))
            .await;

        saga.advance(SagaStep::UserCreateAttempt, now);
        self.deps.record(&mut saga).await;

        let user = User::new(
            &data.first_name,
            &data.last_name,
            &identity.username,
            identity.auth_identity_id,
            now,
        );
        let organization =
            Organization::new(Organization::default_name(&user.first_name), user.id, now);
        let membership = Membership::new(user.id, organization.id, MembershipRole::Owner, now);

        let changes = ChangeSet {
            identity_links: vec![IdentityLink {
                auth_identity_id: identity.auth_identity_id,
                user_id: user.id,
                mark_email_verified: false,
            }],
            users: vec![user.clone()],
            organizations: vec![organization.clone()],
            memberships: vec![membership],
            ..ChangeSet::default()
        };

        if let Err(e) = self.deps.backends.unit_of_work.commit(changes, now).await {
            let error = ServiceError::from(e);
            self.deps
                .user_step_failed(&mut saga, &identity, &error, now)
                .await;
            return Err(error);
        }

        saga.advance(SagaStep::UserCreated, now);
        saga.complete(now);
        self.deps.record(&mut saga).await;

        let verification_link = identity
            .verification_token
            .as_deref()
            .filter(|_| identity.send_verification_token)
            .map(|token| self.deps.verification_link(token));

        self.deps
            .emit(DomainEvent::SignUpSucceeded(SignUpSucceeded {
                saga_id: saga.id,
                id: user.id,
                first_name: user.first_name.clone(),
                last_name: user.last_name.clone(),
                email: user.email.clone(),
                verification_link,
                send_verification_token: identity.send_verification_token,
                organization_id: organization.id,
            }))
            .await;

        tracing::info!(
            saga_id = %saga.id,
            user_id = %user.id,
            organization_id = %organization.id,
            "Sign-up saga completed"
        );

        Ok(SignUpOutcome {
            saga_id: saga.id,
            auth_identity_id: identity.auth_identity_id,
            user_id: user.id,
            organization_id: organization.id,
            username: identity.username,
            email_verified: identity.email_verified,
            verification_token: identity.verification_token,
            send_verification_token: identity.send_verification_token,
        })
    }
}

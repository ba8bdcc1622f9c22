use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use super::{validate_credential_input, validation_failed, SagaDeps};
use crate::events::{DomainEvent, InvitationAccepted};
use crate::models::{
    normalize_username, Membership, MembershipRole, SagaInstance, SagaKind, SagaStep, User,
};
use crate::services::{ErrorKind, ServiceError};
use crate::store::{ChangeSet, IdentityLink, InvitationAcceptance};
use crate::strategy::Credential;
use crate::utils::hash_token;
use crate::utils::validation::validate_person_name;

#[derive(Debug, Clone, Validate)]
pub struct InvitationSignUpData {
    #[validate(length(min = 1, message = "must not be empty"))]
    pub invitation_token: String,
    #[validate(custom(function = "validate_person_name"))]
    pub first_name: String,
    #[validate(custom(function = "validate_person_name"))]
    pub last_name: String,
    pub email: String,
    pub credential: Credential,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvitationSignUpOutcome {
    pub saga_id: Uuid,
    pub auth_identity_id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub role: MembershipRole,
}

/// Sign-up through an invitation: joins the inviting organization instead
/// of creating one. The invitation proves the email, so the identity is
/// verified as part of the commit.
#[derive(Clone)]
pub struct InvitationSignUpSaga {
    deps: SagaDeps,
}

impl InvitationSignUpSaga {
    pub fn new(deps: SagaDeps) -> Self {
        Self { deps }
    }

    #[instrument(
        skip(self, data, now),
        fields(saga = "invitation_sign_up", provider = self.deps.strategy.provider().as_str())
    )]
    pub async fn execute(
        &self,
        data: InvitationSignUpData,
        now: DateTime<Utc>,
    ) -> Result<InvitationSignUpOutcome, ServiceError> {
        data.validate().map_err(validation_failed)?;
        validate_credential_input(&data.email, &data.credential, &self.deps.password_policy)?;

        let directory = &self.deps.backends.directory;

        let invitation = directory
            .find_invitation_by_token_hash(&hash_token(&data.invitation_token))
            .await?
            .filter(|invitation| invitation.is_acceptable(now))
            .ok_or_else(|| {
                ServiceError::domain(
                    ErrorKind::InvalidOrExpiredInvitation,
                    "Invitation is invalid or has expired",
                )
            })?;

        if !invitation.is_for(&data.email) {
            return Err(email_mismatch());
        }

        if directory.find_user_by_email(&data.email).await?.is_some() {
            return Err(ServiceError::domain(
                ErrorKind::UserAlreadyExists,
                "A user with this email already exists. Please sign in to accept the invitation.",
            ));
        }

        let mut saga = SagaInstance::start(
            SagaKind::InvitationSignUp,
            &normalize_username(&data.email),
            now,
        );
        self.deps.backends.sagas.insert_saga(&saga).await?;
        tracing::info!(
            saga_id = %saga.id,
            invitation_id = %invitation.id,
            organization_id = %invitation.organization_id,
            "Invitation sign-up saga started"
        );

        let identity = self
            .deps
            .create_identity(&mut saga, &data.email, &data.credential, true, now)
            .await?;

        // Providers that supply their own email (OAuth) can still disagree
        // with the invitation; undo the identity right away.
        if !invitation.is_for(&identity.username) {
            if let Err(e) = self
                .deps
                .strategy
                .delete_identity(identity.auth_identity_id)
                .await
            {
                tracing::error!(
                    saga_id = %saga.id,
                    auth_identity_id = %identity.auth_identity_id,
                    error = %e,
                    "Failed to remove identity created for the wrong email"
                );
            }
            saga.fail(SagaStep::IdentityCreateFailed, email_mismatch().to_string(), now);
            self.deps.record(&mut saga).await;
            return Err(email_mismatch());
        }

        saga.advance(SagaStep::UserCreateAttempt, now);
        self.deps.record(&mut saga).await;

        let user = User::new(
            &data.first_name,
            &data.last_name,
            &identity.username,
            identity.auth_identity_id,
            now,
        );
        let membership = Membership::new(user.id, invitation.organization_id, invitation.role, now);

        let changes = ChangeSet {
            invitation_acceptances: vec![InvitationAcceptance {
                invitation_id: invitation.id,
            }],
            identity_links: vec![IdentityLink {
                auth_identity_id: identity.auth_identity_id,
                user_id: user.id,
                mark_email_verified: true,
            }],
            users: vec![user.clone()],
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

        self.deps
            .emit(DomainEvent::InvitationAccepted(InvitationAccepted {
                saga_id: saga.id,
                user_id: user.id,
                organization_id: invitation.organization_id,
                email: user.email.clone(),
                first_name: Some(user.first_name.clone()),
            }))
            .await;

        tracing::info!(
            saga_id = %saga.id,
            user_id = %user.id,
            organization_id = %invitation.organization_id,
            role = invitation.role.as_str(),
            "Invitation accepted"
        );

        Ok(InvitationSignUpOutcome {
            saga_id: saga.id,
            auth_identity_id: identity.auth_identity_id,
            user_id: user.id,
            organization_id: invitation.organization_id,
            role: invitation.role,
        })
    }
}

fn email_mismatch() -> ServiceError {
    ServiceError::domain(
        ErrorKind::InvitationEmailMismatch,
        "This invitation was sent to a different email address",
    )
}

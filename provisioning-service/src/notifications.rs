//! Mail sent in reaction to provisioning events.

use async_trait::async_trait;
use std::sync::Arc;

use crate::events::{DomainEvent, EventHandler, EventName};
use crate::services::EmailProvider;
use crate::store::DirectoryRepository;

/// Sends the verification link after a self-service sign-up.
pub struct VerificationEmailHandler {
    email: Arc<dyn EmailProvider>,
}

impl VerificationEmailHandler {
    pub fn new(email: Arc<dyn EmailProvider>) -> Self {
        Self { email }
    }
}

#[async_trait]
impl EventHandler for VerificationEmailHandler {
    fn name(&self) -> &'static str {
        "notification.verification_email"
    }

    fn subscribes_to(&self) -> EventName {
        EventName::SignUpSucceeded
    }

    async fn handle(&self, event: &DomainEvent) {
        let DomainEvent::SignUpSucceeded(payload) = event else {
            return;
        };

        if !payload.send_verification_token {
            return;
        }
        let Some(link) = payload.verification_link.as_deref() else {
            tracing::warn!(saga_id = %payload.saga_id, "Verification requested without a link");
            return;
        };

        match self
            .email
            .send_verification_email(&payload.email, &payload.first_name, link)
            .await
        {
            Ok(()) => tracing::info!(user_id = %payload.id, "Verification email sent"),
            Err(e) => tracing::error!(
                user_id = %payload.id,
                saga_id = %payload.saga_id,
                error = %e,
                "Failed to send verification email"
            ),
        }
    }
}

/// Welcomes a user who joined through an invitation.
pub struct WelcomeEmailHandler {
    email: Arc<dyn EmailProvider>,
    directory: Arc<dyn DirectoryRepository>,
}

impl WelcomeEmailHandler {
    pub fn new(email: Arc<dyn EmailProvider>, directory: Arc<dyn DirectoryRepository>) -> Self {
        Self { email, directory }
    }
}

#[async_trait]
impl EventHandler for WelcomeEmailHandler {
    fn name(&self) -> &'static str {
        "notification.welcome_email"
    }

    fn subscribes_to(&self) -> EventName {
        EventName::InvitationAccepted
    }

    async fn handle(&self, event: &DomainEvent) {
        let DomainEvent::InvitationAccepted(payload) = event else {
            return;
        };

        let organization_name = match self
            .directory
            .find_organization_by_id(payload.organization_id)
            .await
        {
            Ok(Some(organization)) => organization.name,
            Ok(None) => {
                tracing::warn!(
                    organization_id = %payload.organization_id,
                    "Organization missing, skipping welcome email"
                );
                return;
            }
            Err(e) => {
                tracing::error!(
                    organization_id = %payload.organization_id,
                    error = %e,
                    "Failed to load organization for welcome email"
                );
                return;
            }
        };

        if let Err(e) = self
            .email
            .send_welcome_email(
                &payload.email,
                payload.first_name.as_deref(),
                &organization_name,
            )
            .await
        {
            tracing::error!(user_id = %payload.user_id, error = %e, "Failed to send welcome email");
            return;
        }

        tracing::info!(user_id = %payload.user_id, "Welcome email sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{InvitationAccepted, SignUpSucceeded};
    use crate::models::Organization;
    use crate::services::{MockEmailService, SentEmailKind};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use uuid::Uuid;

    fn signed_up(send: bool, link: Option<&str>) -> DomainEvent {
        DomainEvent::SignUpSucceeded(SignUpSucceeded {
            saga_id: Uuid::new_v4(),
            id: Uuid::new_v4(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            verification_link: link.map(str::to_string),
            send_verification_token: send,
            organization_id: Uuid::new_v4(),
        })
    }

    #[tokio::test]
    async fn test_verification_email_sent_when_requested() {
        let mailer = Arc::new(MockEmailService::new());
        let handler = VerificationEmailHandler::new(mailer.clone());

        handler
            .handle(&signed_up(true, Some("https://app/auth/verify?token=t")))
            .await;
        handler.handle(&signed_up(false, Some("https://app/x"))).await;
        handler.handle(&signed_up(true, None)).await;

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SentEmailKind::Verification);
        assert_eq!(sent[0].detail, "https://app/auth/verify?token=t");
    }

    #[tokio::test]
    async fn test_welcome_email_names_organization() {
        let store = Arc::new(MemoryStore::new());
        let organization = Organization::new("Acme Tutors".into(), Uuid::new_v4(), Utc::now());
        store.seed_organization(organization.clone()).unwrap();

        let mailer = Arc::new(MockEmailService::new());
        let handler = WelcomeEmailHandler::new(mailer.clone(), store);

        handler
            .handle(&DomainEvent::InvitationAccepted(InvitationAccepted {
                saga_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                organization_id: organization.id,
                email: "grace@example.com".into(),
                first_name: Some("Grace".into()),
            }))
            .await;

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SentEmailKind::Welcome);
        assert_eq!(sent[0].detail, "Acme Tutors");
    }
}

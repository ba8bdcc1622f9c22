//! Domain events exchanged between the provisioning saga and its
//! downstream handlers.
//!
//! Delivery is asynchronous and fire-and-forget: publishing never waits for
//! a handler, handlers never report back to the publisher, and no ordering
//! is promised between events.

mod bus;
mod recording;

pub use bus::{EventDispatcher, InProcessEventBus};
pub use recording::RecordingEventBus;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::AuthProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    AuthIdentityCreated,
    AuthIdentityFailed,
    UserFailed,
    SignUpSucceeded,
    InvitationAccepted,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::AuthIdentityCreated => "auth_identity.created",
            EventName::AuthIdentityFailed => "auth_identity.failed",
            EventName::UserFailed => "user.failed",
            EventName::SignUpSucceeded => "signup.succeed",
            EventName::InvitationAccepted => "invitation.accepted",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthIdentityCreated {
    pub saga_id: Uuid,
    pub auth_identity_id: Uuid,
    pub username: String,
    pub provider: AuthProvider,
    pub first_name: String,
    pub last_name: String,
    pub send_verification_token: bool,
}

/// Identity creation failed for infrastructure reasons; a half-written
/// identity may exist under `username`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthIdentityFailed {
    pub saga_id: Uuid,
    pub username: String,
}

/// The user step failed after the identity was committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFailed {
    pub saga_id: Uuid,
    pub username: String,
    pub auth_identity_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpSucceeded {
    pub saga_id: Uuid,
    /// User id.
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub verification_link: Option<String>,
    pub send_verification_token: bool,
    pub organization_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationAccepted {
    pub saga_id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload")]
pub enum DomainEvent {
    #[serde(rename = "auth_identity.created")]
    AuthIdentityCreated(AuthIdentityCreated),
    #[serde(rename = "auth_identity.failed")]
    AuthIdentityFailed(AuthIdentityFailed),
    #[serde(rename = "user.failed")]
    UserFailed(UserFailed),
    #[serde(rename = "signup.succeed")]
    SignUpSucceeded(SignUpSucceeded),
    #[serde(rename = "invitation.accepted")]
    InvitationAccepted(InvitationAccepted),
}

impl DomainEvent {
    pub fn name(&self) -> EventName {
        match self {
            DomainEvent::AuthIdentityCreated(_) => EventName::AuthIdentityCreated,
            DomainEvent::AuthIdentityFailed(_) => EventName::AuthIdentityFailed,
            DomainEvent::UserFailed(_) => EventName::UserFailed,
            DomainEvent::SignUpSucceeded(_) => EventName::SignUpSucceeded,
            DomainEvent::InvitationAccepted(_) => EventName::InvitationAccepted,
        }
    }

    pub fn saga_id(&self) -> Uuid {
        match self {
            DomainEvent::AuthIdentityCreated(e) => e.saga_id,
            DomainEvent::AuthIdentityFailed(e) => e.saga_id,
            DomainEvent::UserFailed(e) => e.saga_id,
            DomainEvent::SignUpSucceeded(e) => e.saga_id,
            DomainEvent::InvitationAccepted(e) => e.saga_id,
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Hand the event to the transport. Returns once it is queued, not
    /// once it is handled.
    async fn publish(&self, event: DomainEvent) -> Result<(), AppError>;
}

/// A subscriber. `handle` has no error channel: failures are logged and
/// recorded by the handler itself.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn subscribes_to(&self) -> EventName;

    async fn handle(&self, event: &DomainEvent);
}

//! Saga log record for provisioning sagas.
//!
//! Every sign-up attempt gets one instance keyed by a generated correlation
//! id. Events emitted by the saga carry that id as `sagaId`, and compensation
//! handlers choose their action from the recorded step instead of guessing
//! from payload shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaKind {
    SignUp,
    InvitationSignUp,
}

impl SagaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaKind::SignUp => "sign_up",
            SagaKind::InvitationSignUp => "invitation_sign_up",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "sign_up" => Some(SagaKind::SignUp),
            "invitation_sign_up" => Some(SagaKind::InvitationSignUp),
            _ => None,
        }
    }
}

/// Progress through the provisioning steps.
///
/// Happy path: `Started -> IdentityCreated -> UserCreateAttempt ->
/// UserCreated -> OrganizationCreated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStep {
    Started,
    IdentityCreated,
    IdentityCreateFailed,
    UserCreateAttempt,
    UserCreateFailed,
    UserCreated,
    OrganizationCreated,
}

impl SagaStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::Started => "started",
            SagaStep::IdentityCreated => "identity_created",
            SagaStep::IdentityCreateFailed => "identity_create_failed",
            SagaStep::UserCreateAttempt => "user_create_attempt",
            SagaStep::UserCreateFailed => "user_create_failed",
            SagaStep::UserCreated => "user_created",
            SagaStep::OrganizationCreated => "organization_created",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "started" => Some(SagaStep::Started),
            "identity_created" => Some(SagaStep::IdentityCreated),
            "identity_create_failed" => Some(SagaStep::IdentityCreateFailed),
            "user_create_attempt" => Some(SagaStep::UserCreateAttempt),
            "user_create_failed" => Some(SagaStep::UserCreateFailed),
            "user_created" => Some(SagaStep::UserCreated),
            "organization_created" => Some(SagaStep::OrganizationCreated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Running,
    Completed,
    /// Failed before anything was committed; nothing to undo.
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
            SagaStatus::CompensationFailed => "compensation_failed",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "running" => Some(SagaStatus::Running),
            "completed" => Some(SagaStatus::Completed),
            "failed" => Some(SagaStatus::Failed),
            "compensating" => Some(SagaStatus::Compensating),
            "compensated" => Some(SagaStatus::Compensated),
            "compensation_failed" => Some(SagaStatus::CompensationFailed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Failed
                | SagaStatus::Compensated
                | SagaStatus::CompensationFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SagaInstance {
    pub id: Uuid,
    pub kind: SagaKind,
    pub step: SagaStep,
    pub status: SagaStatus,
    pub username: String,
    pub auth_identity_id: Option<Uuid>,
    pub error: Option<String>,
    pub compensation_attempts: i32,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaInstance {
    pub fn start(kind: SagaKind, username: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            step: SagaStep::Started,
            status: SagaStatus::Running,
            username: username.to_string(),
            auth_identity_id: None,
            error: None,
            compensation_attempts: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, step: SagaStep, now: DateTime<Utc>) {
        self.step = step;
        self.updated_at = now;
    }

    pub fn identity_created(&mut self, auth_identity_id: Uuid, now: DateTime<Utc>) {
        self.auth_identity_id = Some(auth_identity_id);
        self.advance(SagaStep::IdentityCreated, now);
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.step = SagaStep::OrganizationCreated;
        self.status = SagaStatus::Completed;
        self.updated_at = now;
    }

    /// Failure with nothing committed upstream.
    pub fn fail(&mut self, step: SagaStep, error: String, now: DateTime<Utc>) {
        self.step = step;
        self.status = SagaStatus::Failed;
        self.error = Some(error);
        self.updated_at = now;
    }

    /// Failure after an upstream step committed; a compensation event follows.
    pub fn begin_compensation(&mut self, step: SagaStep, error: String, now: DateTime<Utc>) {
        self.step = step;
        self.status = SagaStatus::Compensating;
        self.error = Some(error);
        self.updated_at = now;
    }

    pub fn mark_compensated(&mut self, now: DateTime<Utc>) {
        self.status = SagaStatus::Compensated;
        self.compensation_attempts += 1;
        self.updated_at = now;
    }

    pub fn mark_compensation_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = SagaStatus::CompensationFailed;
        self.compensation_attempts += 1;
        self.error = Some(error);
        self.updated_at = now;
    }

    /// Counts a re-delivery of the compensation event.
    pub fn record_redrive(&mut self, now: DateTime<Utc>) {
        self.compensation_attempts += 1;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_reaches_completed() {
        let now = Utc::now();
        let mut saga = SagaInstance::start(SagaKind::SignUp, "ada@example.com", now);
        let identity_id = Uuid::new_v4();

        saga.identity_created(identity_id, now);
        saga.advance(SagaStep::UserCreateAttempt, now);
        saga.advance(SagaStep::UserCreated, now);
        saga.complete(now);

        assert_eq!(saga.step, SagaStep::OrganizationCreated);
        assert_eq!(saga.status, SagaStatus::Completed);
        assert_eq!(saga.auth_identity_id, Some(identity_id));
        assert!(saga.status.is_terminal());
    }

    #[test]
    fn test_compensation_is_not_terminal_until_handled() {
        let now = Utc::now();
        let mut saga = SagaInstance::start(SagaKind::InvitationSignUp, "ada@example.com", now);
        saga.begin_compensation(SagaStep::UserCreateFailed, "db down".into(), now);

        assert!(!saga.status.is_terminal());
        saga.mark_compensated(now);
        assert!(saga.status.is_terminal());
        assert_eq!(saga.compensation_attempts, 1);
    }

    #[test]
    fn test_codes_round_trip() {
        for step in [
            SagaStep::Started,
            SagaStep::IdentityCreated,
            SagaStep::IdentityCreateFailed,
            SagaStep::UserCreateAttempt,
            SagaStep::UserCreateFailed,
            SagaStep::UserCreated,
            SagaStep::OrganizationCreated,
        ] {
            assert_eq!(SagaStep::from_code(step.as_str()), Some(step));
        }
        assert_eq!(
            SagaStatus::from_code("compensation_failed"),
            Some(SagaStatus::CompensationFailed)
        );
        assert_eq!(SagaKind::from_code("sign_in"), None);
    }
}

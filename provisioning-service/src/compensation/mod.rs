//! Undo steps for failed provisioning sagas.
//!
//! The compensating action is looked up from the step recorded in the saga
//! log. Steps without a plan are reported as `COMPENSATION_NOT_IMPLEMENTED`
//! rather than silently ignored.

mod handlers;

pub use handlers::{AuthIdentityFailedHandler, UserFailedHandler};

use crate::models::SagaStep;
use crate::services::{ErrorKind, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationPlan {
    /// The user step failed: remove the committed identity unless a user
    /// already owns it.
    DeleteOrphanedIdentity,
    /// Identity creation failed midway: remove whatever was written for
    /// the username during this saga.
    DeleteHalfWrittenIdentity,
}

impl CompensationPlan {
    pub fn for_step(step: SagaStep) -> Result<Self, ServiceError> {
        match step {
            SagaStep::UserCreateFailed => Ok(CompensationPlan::DeleteOrphanedIdentity),
            SagaStep::IdentityCreateFailed => Ok(CompensationPlan::DeleteHalfWrittenIdentity),
            other => Err(not_implemented(other.as_str())),
        }
    }
}

/// Credential operations that change state outside a saga. None of them
/// has a compensating action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOperation {
    ChangePassword,
    ResetPassword,
    SignIn,
}

impl CredentialOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialOperation::ChangePassword => "change_password",
            CredentialOperation::ResetPassword => "reset_password",
            CredentialOperation::SignIn => "sign_in",
        }
    }

    pub fn compensation(&self) -> Result<CompensationPlan, ServiceError> {
        Err(not_implemented(self.as_str()))
    }
}

fn not_implemented(what: &str) -> ServiceError {
    ServiceError::domain(
        ErrorKind::CompensationNotImplemented,
        format!("No compensation is defined for {}", what),
    )
}

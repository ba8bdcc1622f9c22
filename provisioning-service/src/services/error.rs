use service_core::error::AppError;
use thiserror::Error;

/// Stable codes for business-rule violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ValidationFailed,
    WeakPassword,
    EmailAlreadyExists,
    InvalidCredentials,
    EmailNotVerified,
    AccountLocked,
    AccountNotProvisioned,
    UserAccountDeleted,
    UserAccountSuspended,
    NoActiveMemberships,
    InvalidRefreshToken,
    RefreshTokenExpiredOrRevoked,
    DeviceMismatch,
    InvalidAccessToken,
    InvalidVerificationToken,
    VerificationTokenExpired,
    TokenAlreadyUsed,
    EmailAlreadyVerified,
    IdentityNotFound,
    InvalidResetToken,
    ResetTokenExpired,
    PasswordReuse,
    MethodNotSupported,
    PasswordOperationsNotAllowed,
    InvalidOrExpiredInvitation,
    InvitationEmailMismatch,
    UserAlreadyExists,
    PlanNotFound,
    CompensationNotImplemented,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "VALIDATION_FAILED",
            ErrorKind::WeakPassword => "WEAK_PASSWORD",
            ErrorKind::EmailAlreadyExists => "EMAIL_ALREADY_EXISTS",
            ErrorKind::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorKind::EmailNotVerified => "EMAIL_NOT_VERIFIED",
            ErrorKind::AccountLocked => "ACCOUNT_LOCKED",
            ErrorKind::AccountNotProvisioned => "ACCOUNT_NOT_PROVISIONED",
            ErrorKind::UserAccountDeleted => "USER_ACCOUNT_DELETED",
            ErrorKind::UserAccountSuspended => "USER_ACCOUNT_SUSPENDED",
            ErrorKind::NoActiveMemberships => "NO_ACTIVE_MEMBERSHIPS",
            ErrorKind::InvalidRefreshToken => "INVALID_REFRESH_TOKEN",
            ErrorKind::RefreshTokenExpiredOrRevoked => "REFRESH_TOKEN_EXPIRED_OR_REVOKED",
            ErrorKind::DeviceMismatch => "DEVICE_MISMATCH",
            ErrorKind::InvalidAccessToken => "INVALID_ACCESS_TOKEN",
            ErrorKind::InvalidVerificationToken => "INVALID_VERIFICATION_TOKEN",
            ErrorKind::VerificationTokenExpired => "VERIFICATION_TOKEN_EXPIRED",
            ErrorKind::TokenAlreadyUsed => "TOKEN_ALREADY_USED",
            ErrorKind::EmailAlreadyVerified => "EMAIL_ALREADY_VERIFIED",
            ErrorKind::IdentityNotFound => "IDENTITY_NOT_FOUND",
            ErrorKind::InvalidResetToken => "INVALID_RESET_TOKEN",
            ErrorKind::ResetTokenExpired => "RESET_TOKEN_EXPIRED",
            ErrorKind::PasswordReuse => "PASSWORD_REUSE",
            ErrorKind::MethodNotSupported => "METHOD_NOT_SUPPORTED",
            ErrorKind::PasswordOperationsNotAllowed => "PASSWORD_OPERATIONS_NOT_ALLOWED",
            ErrorKind::InvalidOrExpiredInvitation => "INVALID_OR_EXPIRED_INVITATION",
            ErrorKind::InvitationEmailMismatch => "INVITATION_EMAIL_MISMATCH",
            ErrorKind::UserAlreadyExists => "USER_ALREADY_EXISTS",
            ErrorKind::PlanNotFound => "PLAN_NOT_FOUND",
            ErrorKind::CompensationNotImplemented => "COMPENSATION_NOT_IMPLEMENTED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of any engine operation.
///
/// `Domain` failures carry a message fit for direct display and are never
/// retried. `Application` failures are infrastructure faults.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{message}")]
    Domain { kind: ErrorKind, message: String },

    #[error(transparent)]
    Application(#[from] AppError),
}

impl ServiceError {
    pub fn domain(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServiceError::Domain {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ServiceError::Domain { kind, .. } => Some(*kind),
            ServiceError::Application(_) => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Domain { kind, .. } => kind.code(),
            ServiceError::Application(err) => err.code(),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, ServiceError::Domain { .. })
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::Application(AppError::InternalError(err))
    }
}

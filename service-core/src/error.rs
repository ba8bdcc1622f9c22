use thiserror::Error;

/// Application and infrastructure failures shared by every service.
///
/// Business-rule violations are not modelled here; services wrap this type
/// next to their own domain error kinds.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Bad Gateway: {0}")]
    BadGateway(String),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Email error: {0}")]
    EmailError(String),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code, used in logs and error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "VALIDATION_FAILED",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::InternalError(_) => "INTERNAL_ERROR",
            AppError::BadGateway(_) => "BAD_GATEWAY",
            AppError::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            AppError::DatabaseError(_) => "DATABASE_ERROR",
            AppError::EmailError(_) => "EMAIL_ERROR",
            AppError::ConfigError(_) => "CONFIG_ERROR",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ServiceUnavailable
                | AppError::DatabaseError(_)
                | AppError::BadGateway(_)
                | AppError::Conflict(_)
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(AppError::ServiceUnavailable.code(), "SERVICE_UNAVAILABLE");
        assert_eq!(
            AppError::DatabaseError(anyhow::anyhow!("boom")).code(),
            "DATABASE_ERROR"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::DatabaseError(anyhow::anyhow!("timeout")).is_retryable());
        assert!(!AppError::EmailError("rejected".into()).is_retryable());
        assert!(!AppError::InternalError(anyhow::anyhow!("bug")).is_retryable());
    }

    #[test]
    fn test_io_error_maps_to_internal() {
        let err: AppError = std::io::Error::other("disk").into();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }
}

pub mod auth_identity;
pub mod device;
pub mod invitation;
pub mod organization;
pub mod password_reset_token;
pub mod refresh_token;
pub mod saga;
pub mod subscription;
pub mod user;
pub mod verification_token;

pub use auth_identity::{normalize_username, AuthIdentity, AuthProvider, LoginFailure};
pub use device::{device_matches, ClientFamily, DeviceDescriptor, OsFamily};
pub use invitation::{Invitation, InvitationStatus};
pub use organization::{Membership, MembershipRole, MembershipStatus, Organization};
pub use password_reset_token::PasswordResetToken;
pub use refresh_token::{RefreshToken, SessionOrigin};
pub use saga::{SagaInstance, SagaKind, SagaStatus, SagaStep};
pub use subscription::{Plan, PlanTier, Subscription, SubscriptionStatus};
pub use user::{User, UserStatus};
pub use verification_token::VerificationToken;

use thiserror::Error;

/// Violations of single-use token transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Token has already been used")]
    AlreadyUsed,
    #[error("Token was replaced by a newer one")]
    Superseded,
}

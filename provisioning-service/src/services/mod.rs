//! Services layer: session handling, password policy, admission control
//! and outbound mail.

pub mod admission;
mod email;
pub mod error;
mod jwt;
pub mod policy;
pub mod session;

pub use admission::{AdmissionService, ClassAdmission};
pub use email::{EmailProvider, EmailService, MockEmailService, SentEmail, SentEmailKind};
pub use error::{ErrorKind, ServiceError};
pub use jwt::{AccessTokenClaims, JwtService};
pub use policy::{PasswordPolicy, PolicyError, PolicyService};
pub use session::{ClientInfo, RefreshRequest, SessionService, SessionTokens};

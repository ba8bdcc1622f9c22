use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::auth_identity::AuthProvider;
use super::device::DeviceDescriptor;
use crate::utils::token::hash_token;

/// Refresh session. Only the SHA-256 of the opaque token is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub auth_identity_id: Uuid,
    pub token_hash: String,
    pub provider: Option<AuthProvider>,
    pub device: Option<DeviceDescriptor>,
    pub ip_address: Option<String>,
    pub is_revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields captured when a session is opened.
#[derive(Debug, Clone, Default)]
pub struct SessionOrigin {
    pub provider: Option<AuthProvider>,
    pub device: Option<DeviceDescriptor>,
    pub ip_address: Option<String>,
}

impl RefreshToken {
    pub fn new(
        user_id: Uuid,
        auth_identity_id: Uuid,
        token: &str,
        ttl: Duration,
        origin: SessionOrigin,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            auth_identity_id,
            token_hash: hash_token(token),
            provider: origin.provider,
            device: origin.device,
            ip_address: origin.ip_address,
            is_revoked: false,
            revoked_at: None,
            expires_at: now + ttl,
            last_used_at: None,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Usable iff not revoked and not past expiry.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked && !self.is_expired(now)
    }
}

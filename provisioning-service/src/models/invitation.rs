//! Invitation model - organization invitations with a pre-assigned role.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth_identity::normalize_username;
use super::organization::MembershipRole;
use crate::utils::token::hash_token;

/// Invitation state codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Revoked,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Revoked => "revoked",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "pending" => Some(InvitationStatus::Pending),
            "accepted" => Some(InvitationStatus::Accepted),
            "revoked" => Some(InvitationStatus::Revoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invitation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub role: MembershipRole,
    pub token_hash: String,
    pub status: InvitationStatus,
    pub expires_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub invited_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Invitation {
    pub fn new(
        organization_id: Uuid,
        email: &str,
        role: MembershipRole,
        token: &str,
        ttl: Duration,
        invited_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            email: normalize_username(email),
            role,
            token_hash: hash_token(token),
            status: InvitationStatus::Pending,
            expires_at: now + ttl,
            accepted_at: None,
            invited_by,
            created_at: now,
        }
    }

    /// Pending and still inside its validity window.
    pub fn is_acceptable(&self, now: DateTime<Utc>) -> bool {
        self.status == InvitationStatus::Pending && self.expires_at >= now
    }

    pub fn is_for(&self, email: &str) -> bool {
        self.email == normalize_username(email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_invitation_is_not_acceptable() {
        let now = Utc::now();
        let invitation = Invitation::new(
            Uuid::new_v4(),
            "Guest@Example.com",
            MembershipRole::Instructor,
            "invite",
            Duration::days(7),
            None,
            now,
        );

        assert!(invitation.is_acceptable(now));
        assert!(invitation.is_acceptable(invitation.expires_at));
        assert!(!invitation.is_acceptable(invitation.expires_at + Duration::seconds(1)));
        assert!(invitation.is_for(" guest@example.COM"));
    }

    #[test]
    fn test_revoked_invitation_is_not_acceptable() {
        let now = Utc::now();
        let mut invitation = Invitation::new(
            Uuid::new_v4(),
            "guest@example.com",
            MembershipRole::Member,
            "invite",
            Duration::days(7),
            None,
            now,
        );
        invitation.status = InvitationStatus::Revoked;
        assert!(!invitation.is_acceptable(now));
    }
}

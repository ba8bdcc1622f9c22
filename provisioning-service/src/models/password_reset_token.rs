use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::TokenError;
use crate::utils::token::hash_token;

/// Single-use password reset token.
#[derive(Debug, Clone, PartialEq)]
pub struct PasswordResetToken {
    pub id: Uuid,
    pub auth_identity_id: Uuid,
    pub token_hash: String,
    pub is_used: bool,
    pub used_at: Option<DateTime<Utc>>,
    /// Set when a newer token for the same identity replaced this one.
    pub superseded_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PasswordResetToken {
    pub fn new(auth_identity_id: Uuid, token: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            auth_identity_id,
            token_hash: hash_token(token),
            is_used: false,
            used_at: None,
            superseded_at: None,
            expires_at: now + ttl,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_at.is_some()
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.is_used && !self.is_superseded() && !self.is_expired(now)
    }

    /// Retire an unused token in favour of a newer one. Independent of the
    /// clock, so the replaced token is dead at the instant of replacement.
    pub fn supersede(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_used || self.is_superseded() {
            return false;
        }
        self.superseded_at = Some(now);
        true
    }

    pub fn mark_as_used(&mut self, now: DateTime<Utc>) -> Result<(), TokenError> {
        if self.is_used {
            return Err(TokenError::AlreadyUsed);
        }
        if self.is_superseded() {
            return Err(TokenError::Superseded);
        }
        self.is_used = true;
        self.used_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_token_single_use() {
        let now = Utc::now();
        let mut token =
            PasswordResetToken::new(Uuid::new_v4(), "reset", Duration::minutes(60), now);

        assert!(token.is_valid(now));
        token.mark_as_used(now).unwrap();
        assert!(token.mark_as_used(now).is_err());
        assert!(!token.is_valid(now));
    }

    #[test]
    fn test_no_second_chance_after_expiry() {
        let now = Utc::now();
        let token = PasswordResetToken::new(Uuid::new_v4(), "reset", Duration::minutes(60), now);
        let later = now + Duration::minutes(61);

        assert!(token.is_expired(later));
        assert!(!token.is_valid(later));
    }
}

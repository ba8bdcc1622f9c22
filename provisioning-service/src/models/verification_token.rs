use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::TokenError;
use crate::utils::token::hash_token;

/// Single-use e-mail verification token.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationToken {
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

impl VerificationToken {
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

    /// One-way transition; a second call is an error.
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
    fn test_mark_as_used_twice_fails() {
        let now = Utc::now();
        let mut token = VerificationToken::new(Uuid::new_v4(), "abc", Duration::hours(24), now);

        assert!(token.mark_as_used(now).is_ok());
        assert_eq!(token.mark_as_used(now), Err(TokenError::AlreadyUsed));
        assert!(!token.is_valid(now));
    }

    #[test]
    fn test_superseded_token_is_dead_at_same_instant() {
        let now = Utc::now();
        let mut token = VerificationToken::new(Uuid::new_v4(), "abc", Duration::hours(24), now);

        assert!(token.supersede(now));
        assert!(!token.is_valid(now));
        assert!(!token.supersede(now));
        assert_eq!(token.mark_as_used(now), Err(TokenError::Superseded));
    }

    #[test]
    fn test_expired_token_is_invalid() {
        let now = Utc::now();
        let token = VerificationToken::new(Uuid::new_v4(), "abc", Duration::hours(24), now);

        assert!(token.is_valid(now + Duration::hours(24)));
        assert!(!token.is_valid(now + Duration::hours(24) + Duration::seconds(1)));
    }
}

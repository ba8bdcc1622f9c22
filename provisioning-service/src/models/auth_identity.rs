//! AuthIdentity model - provider-scoped credential record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Credential provider that owns an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthProvider {
    Local,
    ExternalIdp,
    Google,
}

impl AuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthProvider::Local => "local",
            AuthProvider::ExternalIdp => "external_idp",
            AuthProvider::Google => "google",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "local" => Some(AuthProvider::Local),
            "external_idp" => Some(AuthProvider::ExternalIdp),
            "google" => Some(AuthProvider::Google),
            _ => None,
        }
    }
}

/// Outcome of a rejected password check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginFailure {
    /// Still unlocked; this many attempts remain before lockout.
    Remaining(u32),
    /// The failure crossed the threshold and locked the identity.
    Locked { until: DateTime<Utc> },
}

/// Usernames are e-mail addresses compared case-insensitively.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthIdentity {
    pub id: Uuid,
    pub provider: AuthProvider,
    pub provider_user_id: String,
    pub username: String,
    pub user_id: Option<Uuid>,
    pub password_hash: Option<String>,
    pub failed_login_attempts: i32,
    pub last_failed_login_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub is_locked: bool,
    pub is_email_verified: bool,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every successful conditional write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuthIdentity {
    /// Create a new, unlinked and unverified identity.
    pub fn new(
        provider: AuthProvider,
        provider_user_id: String,
        username: &str,
        password_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            provider_user_id,
            username: normalize_username(username),
            user_id: None,
            password_hash,
            failed_login_attempts: 0,
            last_failed_login_at: None,
            locked_until: None,
            is_locked: false,
            is_email_verified: false,
            email_verified_at: None,
            last_login_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply lazy lock expiry. Returns true when the state changed and
    /// needs to be persisted.
    pub fn refresh_lock_state(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_locked {
            return false;
        }

        match self.locked_until {
            Some(until) if now <= until => false,
            _ => {
                self.is_locked = false;
                self.locked_until = None;
                self.failed_login_attempts = 0;
                self.updated_at = now;
                true
            }
        }
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.is_locked && self.locked_until.is_some_and(|until| now <= until)
    }

    /// Whole minutes until the lock lifts, rounded up, never below one.
    pub fn remaining_lock_minutes(&self, now: DateTime<Utc>) -> i64 {
        match self.locked_until {
            Some(until) if until > now => {
                let seconds = (until - now).num_seconds();
                ((seconds + 59) / 60).max(1)
            }
            _ => 0,
        }
    }

    pub fn record_failed_login(
        &mut self,
        now: DateTime<Utc>,
        threshold: u32,
        lockout: Duration,
    ) -> LoginFailure {
        self.failed_login_attempts += 1;
        self.last_failed_login_at = Some(now);
        self.updated_at = now;

        let attempts = self.failed_login_attempts.max(0) as u32;
        if attempts >= threshold {
            let until = now + lockout;
            self.is_locked = true;
            self.locked_until = Some(until);
            LoginFailure::Locked { until }
        } else {
            LoginFailure::Remaining(threshold - attempts)
        }
    }

    pub fn record_successful_login(&mut self, now: DateTime<Utc>) {
        self.failed_login_attempts = 0;
        self.last_failed_login_at = None;
        self.is_locked = false;
        self.locked_until = None;
        self.last_login_at = Some(now);
        self.updated_at = now;
    }

    /// Replacing the password also lifts any lockout.
    pub fn set_password_hash(&mut self, hash: String, now: DateTime<Utc>) {
        self.password_hash = Some(hash);
        self.failed_login_attempts = 0;
        self.last_failed_login_at = None;
        self.is_locked = false;
        self.locked_until = None;
        self.updated_at = now;
    }

    pub fn mark_email_verified(&mut self, now: DateTime<Utc>) {
        self.is_email_verified = true;
        self.email_verified_at = Some(now);
        self.updated_at = now;
    }

    /// A new address has to be verified again.
    pub fn change_username(&mut self, username: &str, now: DateTime<Utc>) {
        self.username = normalize_username(username);
        if self.provider == AuthProvider::Local {
            self.provider_user_id = self.username.clone();
        }
        self.is_email_verified = false;
        self.email_verified_at = None;
        self.updated_at = now;
    }

    pub fn link_user(&mut self, user_id: Uuid, now: DateTime<Utc>) {
        self.user_id = Some(user_id);
        self.updated_at = now;
    }
}

//! Session issuance and refresh-token rotation shared by every strategy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{ErrorKind, ServiceError};
use super::jwt::{AccessTokenClaims, JwtService};
use crate::models::{
    device_matches, AuthIdentity, DeviceDescriptor, RefreshToken, SessionOrigin,
    User, UserStatus,
};
use crate::store::{DirectoryRepository, RefreshTokenRepository};
use crate::utils::{generate_token, hash_token};

/// Where a request came from. Both fields are optional; a missing
/// user agent skips the device check on refresh.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl ClientInfo {
    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.user_agent
            .as_deref()
            .map(DeviceDescriptor::from_user_agent)
    }
}

/// Token pair returned to the client
#[derive(Debug, Clone, Serialize)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user_id: Uuid,
    pub auth_identity_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub refresh_token: String,
    pub client: ClientInfo,
}

#[derive(Clone)]
pub struct SessionService {
    refresh_tokens: Arc<dyn RefreshTokenRepository>,
    directory: Arc<dyn DirectoryRepository>,
    jwt: JwtService,
    max_active_sessions: usize,
}

impl SessionService {
    pub fn new(
        refresh_tokens: Arc<dyn RefreshTokenRepository>,
        directory: Arc<dyn DirectoryRepository>,
        jwt: JwtService,
        max_active_sessions: usize,
    ) -> Self {
        Self {
            refresh_tokens,
            directory,
            jwt,
            max_active_sessions,
        }
    }

    /// Open a session for a signed-in identity.
    pub async fn issue_session(
        &self,
        user: &User,
        identity: &AuthIdentity,
        client: &ClientInfo,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError> {
        let origin = SessionOrigin {
            provider: Some(identity.provider),
            device: client.device(),
            ip_address: client.ip_address.clone(),
        };
        self.issue(user.id, identity.id, &user.email, origin, now)
            .await
    }

    /// Exchange a refresh token for a new pair. The presented token is
    /// revoked before any account checks run.
    pub async fn rotate(
        &self,
        request: &RefreshRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError> {
        let token_hash = hash_token(&request.refresh_token);

        let stored = self
            .refresh_tokens
            .find_refresh_token_by_hash(&token_hash)
            .await?
            .ok_or_else(|| {
                ServiceError::domain(ErrorKind::InvalidRefreshToken, "Invalid refresh token")
            })?;

        if !stored.is_usable(now) {
            return Err(expired_or_revoked());
        }

        let presented = request.client.device();
        if let Some(presented) = &presented {
            if !device_matches(stored.device.as_ref(), presented) {
                tracing::warn!(
                    user_id = %stored.user_id,
                    token_id = %stored.id,
                    "Refresh token presented from a different device"
                );
                return Err(ServiceError::domain(
                    ErrorKind::DeviceMismatch,
                    "Refresh token was issued to a different device",
                ));
            }
        }

        self.refresh_tokens.touch_refresh_token(stored.id, now).await?;
        if !self.refresh_tokens.revoke_refresh_token(stored.id, now).await? {
            // Lost a race against another rotation of the same token.
            return Err(expired_or_revoked());
        }

        let user = self.directory.find_user_by_id(stored.user_id).await?;
        let user = match user {
            Some(user) if user.status != UserStatus::Deleted => user,
            _ => {
                self.refresh_tokens
                    .revoke_all_refresh_tokens(stored.user_id, now)
                    .await?;
                return Err(ServiceError::domain(
                    ErrorKind::UserAccountDeleted,
                    "User account has been deleted",
                ));
            }
        };

        if user.status == UserStatus::Suspended {
            return Err(ServiceError::domain(
                ErrorKind::UserAccountSuspended,
                "User account is suspended",
            ));
        }

        if self.directory.count_active_memberships(user.id).await? == 0 {
            self.refresh_tokens
                .revoke_all_refresh_tokens(user.id, now)
                .await?;
            return Err(ServiceError::domain(
                ErrorKind::NoActiveMemberships,
                "User has no active organization memberships",
            ));
        }

        let origin = SessionOrigin {
            provider: stored.provider,
            device: presented.or(stored.device),
            ip_address: request.client.ip_address.clone().or(stored.ip_address),
        };

        tracing::info!(user_id = %user.id, "Refresh token rotated");
        self.issue(user.id, stored.auth_identity_id, &user.email, origin, now)
            .await
    }

    /// Revoke a single refresh token. Revoking an already revoked token is
    /// not an error.
    pub async fn logout(&self, refresh_token: &str, now: DateTime<Utc>) -> Result<(), ServiceError> {
        let stored = self
            .refresh_tokens
            .find_refresh_token_by_hash(&hash_token(refresh_token))
            .await?
            .ok_or_else(|| {
                ServiceError::domain(ErrorKind::InvalidRefreshToken, "Invalid refresh token")
            })?;

        self.refresh_tokens.revoke_refresh_token(stored.id, now).await?;
        tracing::info!(user_id = %stored.user_id, "Session closed");
        Ok(())
    }

    pub async fn revoke_all(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let revoked = self
            .refresh_tokens
            .revoke_all_refresh_tokens(user_id, now)
            .await?;
        tracing::info!(user_id = %user_id, revoked, "Revoked all sessions");
        Ok(revoked)
    }

    pub fn verify_access_token(&self, token: &str) -> Result<AccessTokenClaims, ServiceError> {
        self.jwt.validate_access_token(token).map_err(|e| {
            tracing::debug!(error = %e, "Access token rejected");
            ServiceError::domain(ErrorKind::InvalidAccessToken, "Invalid or expired access token")
        })
    }

    async fn issue(
        &self,
        user_id: Uuid,
        auth_identity_id: Uuid,
        email: &str,
        origin: SessionOrigin,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError> {
        self.enforce_session_cap(user_id, now).await?;

        let refresh_token = generate_token();
        let record = RefreshToken::new(
            user_id,
            auth_identity_id,
            &refresh_token,
            self.jwt.refresh_token_ttl(),
            origin,
            now,
        );
        self.refresh_tokens.insert_refresh_token(&record).await?;

        let (access_token, expires_in) = self
            .jwt
            .generate_access_token(user_id, auth_identity_id, email, now)?;

        Ok(SessionTokens {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in,
            user_id,
            auth_identity_id,
        })
    }

    /// Make room for one more session: with `count` active tokens and a cap
    /// of `cap`, revoke the oldest `count - cap + 1`.
    async fn enforce_session_cap(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), ServiceError> {
        let active = self
            .refresh_tokens
            .list_active_refresh_tokens(user_id, now)
            .await?;

        if active.len() < self.max_active_sessions {
            return Ok(());
        }

        let excess = active.len() - self.max_active_sessions + 1;
        for token in active.iter().take(excess) {
            self.refresh_tokens.revoke_refresh_token(token.id, now).await?;
        }

        tracing::info!(
            user_id = %user_id,
            revoked = excess,
            cap = self.max_active_sessions,
            "Session cap reached, revoked oldest sessions"
        );
        Ok(())
    }
}

fn expired_or_revoked() -> ServiceError {
    ServiceError::domain(
        ErrorKind::RefreshTokenExpiredOrRevoked,
        "Refresh token has expired or been revoked",
    )
}


use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use service_core::error::AppError;

use crate::config::HashingConfig;

/// Newtype for password to prevent accidental logging
#[derive(Clone)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Newtype for password hash
#[derive(Debug, Clone)]
pub struct PasswordHashString(String);

impl PasswordHashString {
    pub fn new(hash: String) -> Self {
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Argon2id hasher with tunable cost.
///
/// Hashing and verification run on the blocking pool so a burst of logins
/// does not stall the async workers.
#[derive(Clone)]
pub struct CredentialHasher {
    params: Params,
}

impl CredentialHasher {
    pub fn new(config: &HashingConfig) -> Result<Self, AppError> {
        let params = Params::new(
            config.memory_kib,
            config.iterations,
            config.parallelism,
            None,
        )
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid Argon2 parameters: {}", e)))?;

        Ok(Self { params })
    }

    fn argon2(params: Params) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
    }

    pub async fn hash(&self, password: &Password) -> Result<PasswordHashString, AppError> {
        let params = self.params.clone();
        let password = password.clone();

        tokio::task::spawn_blocking(move || hash_with(params, &password))
            .await
            .map_err(|e| AppError::InternalError(e.into()))?
    }

    /// Ok(false) on mismatch; Err only for a malformed stored hash.
    pub async fn verify(
        &self,
        password: &Password,
        password_hash: &PasswordHashString,
    ) -> Result<bool, AppError> {
        let password = password.clone();
        let password_hash = password_hash.clone();

        tokio::task::spawn_blocking(move || verify_with(&password, &password_hash))
            .await
            .map_err(|e| AppError::InternalError(e.into()))?
    }
}

fn hash_with(params: Params, password: &Password) -> Result<PasswordHashString, AppError> {
    let salt = SaltString::generate(&mut OsRng);

    let password_hash = CredentialHasher::argon2(params)
        .hash_password(password.as_str().as_bytes(), &salt)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to hash password: {}", e)))?
        .to_string();

    Ok(PasswordHashString::new(password_hash))
}

fn verify_with(password: &Password, password_hash: &PasswordHashString) -> Result<bool, AppError> {
    let parsed_hash = PasswordHash::new(password_hash.as_str()).map_err(|e| {
        AppError::InternalError(anyhow::anyhow!("Invalid password hash format: {}", e))
    })?;

    // Cost parameters are read back from the PHC string.
    Ok(Argon2::default()
        .verify_password(password.as_str().as_bytes(), &parsed_hash)
        .is_ok())
}

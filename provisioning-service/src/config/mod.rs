use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

use crate::services::policy::PasswordPolicy;
use crate::strategy::AuthProviderKind;

#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_version: String,
    /// Base of links sent in e-mails (verification, invitations).
    pub public_base_url: String,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub credentials: CredentialsConfig,
    pub password_policy: PasswordPolicy,
    pub hashing: HashingConfig,
    pub auth_provider: AuthProviderKind,
    pub external_idp: Option<ExternalIdpConfig>,
    pub google: Option<GoogleOAuthConfig>,
    pub email: EmailConfig,
    pub events: EventsConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub signing_secret: String,
    pub issuer: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

/// Lockout, session and single-use token settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    pub max_failed_login_attempts: u32,
    pub lockout_duration_minutes: i64,
    pub max_active_sessions: usize,
    pub verification_token_ttl_hours: i64,
    pub password_reset_token_ttl_minutes: i64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            max_failed_login_attempts: 5,
            lockout_duration_minutes: 30,
            max_active_sessions: 5,
            verification_token_ttl_hours: 24,
            password_reset_token_ttl_minutes: 60,
        }
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct HashingConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalIdpConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    /// Empty means an unauthenticated relay (local mail catcher).
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    pub queue_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    pub interval_seconds: u64,
    /// How long a saga may sit in `compensating` before its event is re-sent.
    pub compensation_grace_seconds: i64,
    pub max_compensation_attempts: i32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            compensation_grace_seconds: 600,
            max_compensation_attempts: 5,
        }
    }
}

impl ProvisioningConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let auth_provider: AuthProviderKind = get_env("AUTH_PROVIDER", Some("local"), false)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let external_idp = if auth_provider == AuthProviderKind::ExternalIdp {
            Some(ExternalIdpConfig {
                base_url: get_env("EXTERNAL_IDP_BASE_URL", None, is_prod)?,
                api_key: get_env("EXTERNAL_IDP_API_KEY", None, is_prod)?,
                timeout_seconds: parse_env("EXTERNAL_IDP_TIMEOUT_SECONDS", "10", is_prod)?,
            })
        } else {
            None
        };

        let google = if auth_provider == AuthProviderKind::Google {
            Some(GoogleOAuthConfig {
                client_id: get_env("GOOGLE_CLIENT_ID", None, is_prod)?,
                client_secret: get_env("GOOGLE_CLIENT_SECRET", None, is_prod)?,
                redirect_uri: get_env("GOOGLE_REDIRECT_URI", None, is_prod)?,
            })
        } else {
            None
        };

        let config = ProvisioningConfig {
            common: common_config,
            environment: environment.clone(),
            service_version: get_env(
                "SERVICE_VERSION",
                Some(env!("CARGO_PKG_VERSION")),
                false,
            )?,
            public_base_url: get_env("PUBLIC_BASE_URL", Some("http://localhost:3000"), is_prod)?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", false)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", false)?,
            },
            jwt: JwtConfig {
                signing_secret: get_env("JWT_SIGNING_SECRET", None, is_prod)?,
                issuer: get_env("JWT_ISSUER", Some("provisioning-service"), false)?,
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    "15",
                    false,
                )?,
                refresh_token_expiry_days: parse_env("JWT_REFRESH_TOKEN_EXPIRY_DAYS", "7", false)?,
            },
            credentials: CredentialsConfig {
                max_failed_login_attempts: parse_env("MAX_FAILED_LOGIN_ATTEMPTS", "5", false)?,
                lockout_duration_minutes: parse_env("LOCKOUT_DURATION_MINUTES", "30", false)?,
                max_active_sessions: parse_env("MAX_ACTIVE_SESSIONS", "5", false)?,
                verification_token_ttl_hours: parse_env(
                    "VERIFICATION_TOKEN_TTL_HOURS",
                    "24",
                    false,
                )?,
                password_reset_token_ttl_minutes: parse_env(
                    "PASSWORD_RESET_TOKEN_TTL_MINUTES",
                    "60",
                    false,
                )?,
            },
            password_policy: PasswordPolicy {
                min_length: parse_env("PASSWORD_MIN_LENGTH", "8", false)?,
                ..PasswordPolicy::default()
            },
            hashing: HashingConfig {
                memory_kib: parse_env("ARGON2_MEMORY_KIB", "19456", false)?,
                iterations: parse_env("ARGON2_ITERATIONS", "2", false)?,
                parallelism: parse_env("ARGON2_PARALLELISM", "1", false)?,
            },
            auth_provider,
            external_idp,
            google,
            email: EmailConfig {
                smtp_host: get_env("SMTP_HOST", Some("localhost"), is_prod)?,
                smtp_port: parse_env("SMTP_PORT", "1025", is_prod)?,
                smtp_username: get_env("SMTP_USERNAME", Some(""), false)?,
                smtp_password: get_env("SMTP_PASSWORD", Some(""), false)?,
                from_address: get_env(
                    "EMAIL_FROM_ADDRESS",
                    Some("no-reply@localhost"),
                    is_prod,
                )?,
            },
            events: EventsConfig {
                queue_capacity: parse_env("EVENT_QUEUE_CAPACITY", "1024", false)?,
            },
            maintenance: MaintenanceConfig {
                interval_seconds: parse_env("MAINTENANCE_INTERVAL_SECONDS", "300", false)?,
                compensation_grace_seconds: parse_env(
                    "COMPENSATION_GRACE_SECONDS",
                    "600",
                    false,
                )?,
                max_compensation_attempts: parse_env("MAX_COMPENSATION_ATTEMPTS", "5", false)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        self.credentials.validate()?;

        if self.events.queue_capacity == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "EVENT_QUEUE_CAPACITY must be greater than 0"
            )));
        }

        if self.environment == Environment::Prod && self.jwt.signing_secret.len() < 32 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_SIGNING_SECRET must be at least 32 bytes in production"
            )));
        }

        Ok(())
    }
}

impl CredentialsConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_failed_login_attempts == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MAX_FAILED_LOGIN_ATTEMPTS must be greater than 0"
            )));
        }

        if self.lockout_duration_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "LOCKOUT_DURATION_MINUTES must be positive"
            )));
        }

        if self.max_active_sessions == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MAX_ACTIVE_SESSIONS must be greater than 0"
            )));
        }

        if self.verification_token_ttl_hours <= 0 || self.password_reset_token_ttl_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Token TTLs must be positive"
            )));
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!("PROD".parse::<Environment>(), Ok(Environment::Prod));
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_get_env_defaults_outside_prod() {
        let value = get_env("PROVISIONING_TEST_SURELY_UNSET", Some("fallback"), false).unwrap();
        assert_eq!(value, "fallback");
        assert!(get_env("PROVISIONING_TEST_SURELY_UNSET", Some("fallback"), true).is_err());
        assert!(get_env("PROVISIONING_TEST_SURELY_UNSET", None, false).is_err());
    }

    #[test]
    fn test_parse_env_reports_key() {
        let err = parse_env::<u32>("PROVISIONING_TEST_SURELY_UNSET", "not-a-number", false)
            .unwrap_err();
        assert!(err.to_string().contains("PROVISIONING_TEST_SURELY_UNSET"));
    }

    #[test]
    fn test_credentials_defaults_are_valid() {
        let credentials = CredentialsConfig::default();
        assert!(credentials.validate().is_ok());
        assert_eq!(credentials.max_failed_login_attempts, 5);
        assert_eq!(credentials.lockout_duration_minutes, 30);
        assert_eq!(credentials.max_active_sessions, 5);
    }

    #[test]
    fn test_zero_session_cap_rejected() {
        let credentials = CredentialsConfig {
            max_active_sessions: 0,
            ..CredentialsConfig::default()
        };
        assert!(credentials.validate().is_err());
    }
}

use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Process-level settings every service shares.
///
/// Loaded from an optional `configuration` file and `APP__*` environment
/// variables, in that order of precedence (environment wins).
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_service_name() -> String {
    "provisioning-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_without_sources() {
        let cfg: Config = Cfg::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.service_name, "provisioning-service");
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.otlp_endpoint.is_none());
    }
}

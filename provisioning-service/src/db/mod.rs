//! Postgres pool for the credential store and saga log.

use crate::config::DatabaseConfig;
use anyhow::Context;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Open the pool and bring the provisioning schema up to date.
///
/// Connection and migration failures both surface as `DATABASE_ERROR` so the
/// binary exits before the event dispatcher starts.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(&config.url)
        .await
        .context("connecting to the provisioning database")
        .map_err(AppError::DatabaseError)?;

    tracing::info!(
        max_connections = config.max_connections,
        "Provisioning database pool ready"
    );

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("applying provisioning migrations")
        .map_err(AppError::DatabaseError)?;

    tracing::info!("Provisioning schema is current");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_connect_creates_saga_log() {
        let config = DatabaseConfig {
            url: "postgres://localhost/provisioning_test".to_string(),
            max_connections: 2,
            min_connections: 1,
        };

        let pool = connect(&config).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sagas")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(count >= 0);
    }
}

//! Periodic housekeeping: purge expired credentials and re-drive
//! compensations that stalled.

use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::MaintenanceConfig;
use crate::events::{AuthIdentityFailed, DomainEvent, EventBus, UserFailed};
use crate::models::{SagaInstance, SagaStep};
use crate::store::Backends;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub refresh_tokens_purged: u64,
    pub verification_tokens_purged: u64,
    pub reset_tokens_purged: u64,
    pub sagas_redriven: usize,
    pub sagas_abandoned: usize,
}

pub struct MaintenanceWorker {
    backends: Backends,
    events: Arc<dyn EventBus>,
    config: MaintenanceConfig,
}

impl MaintenanceWorker {
    pub fn new(backends: Backends, events: Arc<dyn EventBus>, config: MaintenanceConfig) -> Self {
        Self {
            backends,
            events,
            config,
        }
    }

    /// One pass over every job.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, AppError> {
        let mut report = MaintenanceReport {
            refresh_tokens_purged: self
                .backends
                .refresh_tokens
                .delete_expired_refresh_tokens(now)
                .await?,
            verification_tokens_purged: self
                .backends
                .verification_tokens
                .delete_expired_verification_tokens(now)
                .await?,
            reset_tokens_purged: self
                .backends
                .reset_tokens
                .delete_expired_reset_tokens(now)
                .await?,
            ..MaintenanceReport::default()
        };

        let cutoff = now - Duration::seconds(self.config.compensation_grace_seconds);
        let stalled = self.backends.sagas.list_stalled_sagas(cutoff).await?;

        for mut saga in stalled {
            if saga.compensation_attempts >= self.config.max_compensation_attempts {
                saga.mark_compensation_failed(
                    format!(
                        "Compensation abandoned after {} attempts",
                        saga.compensation_attempts
                    ),
                    now,
                );
                if self.save(&mut saga).await {
                    tracing::error!(
                        saga_id = %saga.id,
                        username = %saga.username,
                        "Compensation abandoned, manual cleanup required"
                    );
                    report.sagas_abandoned += 1;
                }
                continue;
            }

            let Some(event) = compensation_event(&saga) else {
                tracing::warn!(
                    saga_id = %saga.id,
                    step = saga.step.as_str(),
                    "Stalled saga has no compensation event to re-send"
                );
                continue;
            };

            saga.record_redrive(now);
            if !self.save(&mut saga).await {
                continue;
            }

            match self.events.publish(event).await {
                Ok(()) => {
                    tracing::info!(
                        saga_id = %saga.id,
                        attempt = saga.compensation_attempts,
                        "Compensation re-driven"
                    );
                    report.sagas_redriven += 1;
                }
                Err(e) => {
                    tracing::error!(saga_id = %saga.id, error = %e, "Failed to re-drive compensation");
                }
            }
        }

        Ok(report)
    }

    /// Runs `run_once` on every tick until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let period = std::time::Duration::from_secs(self.config.interval_seconds.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_seconds = period.as_secs(), "Maintenance worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Maintenance worker shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(report) => tracing::info!(
                            refresh_tokens_purged = report.refresh_tokens_purged,
                            verification_tokens_purged = report.verification_tokens_purged,
                            reset_tokens_purged = report.reset_tokens_purged,
                            sagas_redriven = report.sagas_redriven,
                            sagas_abandoned = report.sagas_abandoned,
                            "Maintenance pass finished"
                        ),
                        Err(e) => tracing::error!(error = %e, "Maintenance pass failed"),
                    }
                }
            }
        }
    }

    /// False when another writer got there first or the write failed.
    async fn save(&self, saga: &mut SagaInstance) -> bool {
        match self.backends.sagas.update_saga(saga).await {
            Ok(()) => true,
            Err(AppError::Conflict(_)) => {
                tracing::info!(saga_id = %saga.id, "Saga changed concurrently, skipping");
                false
            }
            Err(e) => {
                tracing::error!(saga_id = %saga.id, error = %e, "Failed to update stalled saga");
                false
            }
        }
    }
}

fn compensation_event(saga: &SagaInstance) -> Option<DomainEvent> {
    match saga.step {
        SagaStep::UserCreateFailed => saga.auth_identity_id.map(|auth_identity_id| {
            DomainEvent::UserFailed(UserFailed {
                saga_id: saga.id,
                username: saga.username.clone(),
                auth_identity_id,
            })
        }),
        SagaStep::IdentityCreateFailed => Some(DomainEvent::AuthIdentityFailed(AuthIdentityFailed {
            saga_id: saga.id,
            username: saga.username.clone(),
        })),
        _ => None,
    }
}

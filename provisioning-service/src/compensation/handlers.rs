use async_trait::async_trait;
use chrono::Utc;
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

use super::CompensationPlan;
use crate::events::{DomainEvent, EventHandler, EventName};
use crate::models::{AuthIdentity, SagaInstance, SagaStatus};
use crate::services::ServiceError;
use crate::store::Backends;
use crate::strategy::AuthStrategy;

/// Removes the identity left behind when the user step fails.
pub struct UserFailedHandler {
    compensator: Compensator,
}

impl UserFailedHandler {
    pub fn new(backends: Backends, strategy: Arc<dyn AuthStrategy>) -> Self {
        Self {
            compensator: Compensator { backends, strategy },
        }
    }
}

#[async_trait]
impl EventHandler for UserFailedHandler {
    fn name(&self) -> &'static str {
        "compensation.user_failed"
    }

    fn subscribes_to(&self) -> EventName {
        EventName::UserFailed
    }

    async fn handle(&self, event: &DomainEvent) {
        let DomainEvent::UserFailed(payload) = event else {
            return;
        };

        self.compensator
            .compensate(
                payload.saga_id,
                CompensationPlan::DeleteOrphanedIdentity,
                &payload.username,
                Some(payload.auth_identity_id),
            )
            .await;
    }
}

/// Cleans up after an identity creation that failed midway.
pub struct AuthIdentityFailedHandler {
    compensator: Compensator,
}

impl AuthIdentityFailedHandler {
    pub fn new(backends: Backends, strategy: Arc<dyn AuthStrategy>) -> Self {
        Self {
            compensator: Compensator { backends, strategy },
        }
    }
}

#[async_trait]
impl EventHandler for AuthIdentityFailedHandler {
    fn name(&self) -> &'static str {
        "compensation.auth_identity_failed"
    }

    fn subscribes_to(&self) -> EventName {
        EventName::AuthIdentityFailed
    }

    async fn handle(&self, event: &DomainEvent) {
        let DomainEvent::AuthIdentityFailed(payload) = event else {
            return;
        };

        self.compensator
            .compensate(
                payload.saga_id,
                CompensationPlan::DeleteHalfWrittenIdentity,
                &payload.username,
                None,
            )
            .await;
    }
}

#[derive(Clone)]
struct Compensator {
    backends: Backends,
    strategy: Arc<dyn AuthStrategy>,
}

impl Compensator {
    /// Never fails outward. The outcome lands in the saga log.
    async fn compensate(
        &self,
        saga_id: Uuid,
        default_plan: CompensationPlan,
        username: &str,
        auth_identity_id: Option<Uuid>,
    ) {
        let mut saga = match self.backends.sagas.find_saga(saga_id).await {
            Ok(saga) => saga,
            Err(e) => {
                tracing::error!(saga_id = %saga_id, error = %e, "Failed to load saga for compensation");
                return;
            }
        };

        let plan = match &saga {
            Some(s)
                if matches!(
                    s.status,
                    SagaStatus::Compensated | SagaStatus::Completed | SagaStatus::Failed
                ) =>
            {
                tracing::info!(
                    saga_id = %saga_id,
                    status = s.status.as_str(),
                    "Saga is settled, ignoring failure event"
                );
                return;
            }
            Some(s) => CompensationPlan::for_step(s.step),
            None => {
                tracing::warn!(saga_id = %saga_id, "No saga record, compensating from event payload");
                Ok(default_plan)
            }
        };

        let result = match plan {
            Ok(plan) => {
                self.execute(plan, saga.as_ref(), username, auth_identity_id)
                    .await
            }
            Err(e) => Err(e),
        };

        let Some(saga) = saga.as_mut() else {
            if let Err(e) = result {
                tracing::error!(saga_id = %saga_id, code = e.code(), error = %e, "Compensation failed");
            }
            return;
        };

        let now = Utc::now();
        match result {
            Ok(()) => {
                saga.mark_compensated(now);
                tracing::info!(saga_id = %saga_id, "Saga compensated");
            }
            Err(e) => {
                tracing::error!(saga_id = %saga_id, code = e.code(), error = %e, "Compensation failed");
                saga.mark_compensation_failed(format!("{}: {}", e.code(), e), now);
            }
        }

        match self.backends.sagas.update_saga(saga).await {
            Ok(()) => {}
            Err(AppError::Conflict(_)) => {
                tracing::info!(saga_id = %saga_id, "Saga updated by a concurrent compensation");
            }
            Err(e) => {
                tracing::error!(saga_id = %saga_id, error = %e, "Failed to record compensation outcome");
            }
        }
    }

    async fn execute(
        &self,
        plan: CompensationPlan,
        saga: Option<&SagaInstance>,
        username: &str,
        auth_identity_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        match plan {
            CompensationPlan::DeleteOrphanedIdentity => {
                let id = auth_identity_id.or_else(|| saga.and_then(|s| s.auth_identity_id));
                let identity = match id {
                    Some(id) => self.backends.identities.find_identity_by_id(id).await?,
                    None => {
                        self.backends
                            .identities
                            .find_identity_by_username(username)
                            .await?
                    }
                };

                let Some(identity) = identity else {
                    tracing::info!(username = %username, "Identity already gone");
                    return Ok(());
                };

                if self.owned_by_existing_user(&identity).await? {
                    tracing::info!(
                        auth_identity_id = %identity.id,
                        "Identity belongs to a user, leaving it in place"
                    );
                    return Ok(());
                }

                self.strategy.delete_identity(identity.id).await?;
                tracing::info!(auth_identity_id = %identity.id, "Orphaned identity removed");
                Ok(())
            }
            CompensationPlan::DeleteHalfWrittenIdentity => {
                let Some(identity) = self
                    .backends
                    .identities
                    .find_identity_by_username(username)
                    .await?
                else {
                    tracing::info!(username = %username, "Nothing was written for the username");
                    return Ok(());
                };

                if identity.user_id.is_some() {
                    tracing::info!(
                        auth_identity_id = %identity.id,
                        "Identity is linked, leaving it in place"
                    );
                    return Ok(());
                }

                // Without a start time an older, unrelated identity could
                // match the username.
                let Some(saga) = saga else {
                    tracing::warn!(
                        auth_identity_id = %identity.id,
                        "No saga record to bound the identity's age, leaving it in place"
                    );
                    return Ok(());
                };

                if identity.created_at < saga.created_at {
                    tracing::info!(
                        auth_identity_id = %identity.id,
                        "Identity predates the saga, leaving it in place"
                    );
                    return Ok(());
                }

                self.strategy.delete_identity(identity.id).await?;
                tracing::info!(auth_identity_id = %identity.id, "Half-written identity removed");
                Ok(())
            }
        }
    }

    async fn owned_by_existing_user(&self, identity: &AuthIdentity) -> Result<bool, ServiceError> {
        match identity.user_id {
            Some(user_id) => Ok(self
                .backends
                .directory
                .find_user_by_id(user_id)
                .await?
                .is_some()),
            None => Ok(false),
        }
    }
}

//! Class-limit admission control.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{ErrorKind, ServiceError};
use crate::models::{PlanTier, SubscriptionStatus};
use crate::store::BillingRepository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassAdmission {
    pub can_create: bool,
    pub reason: Option<String>,
    pub current_class_count: i64,
    pub class_limit: Option<i64>,
}

impl ClassAdmission {
    fn allow(current: i64, limit: Option<i64>) -> Self {
        Self {
            can_create: true,
            reason: None,
            current_class_count: current,
            class_limit: limit,
        }
    }

    fn deny(current: i64, limit: Option<i64>, reason: impl Into<String>) -> Self {
        Self {
            can_create: false,
            reason: Some(reason.into()),
            current_class_count: current,
            class_limit: limit,
        }
    }
}

#[derive(Clone)]
pub struct AdmissionService {
    billing: Arc<dyn BillingRepository>,
}

impl AdmissionService {
    pub fn new(billing: Arc<dyn BillingRepository>) -> Self {
        Self { billing }
    }

    pub async fn can_create_class(
        &self,
        organization_id: Uuid,
    ) -> Result<ClassAdmission, ServiceError> {
        let current = self.billing.count_classes(organization_id).await?;

        let Some(subscription) = self
            .billing
            .find_subscription_for_organization(organization_id)
            .await?
        else {
            return Ok(ClassAdmission::allow(current, None));
        };

        match subscription.status {
            SubscriptionStatus::Pending => {
                return Ok(ClassAdmission::deny(
                    current,
                    None,
                    "Please complete your billing setup before creating classes.",
                ))
            }
            SubscriptionStatus::Cancelled => {
                return Ok(ClassAdmission::deny(
                    current,
                    None,
                    "Your subscription has been cancelled. Please reactivate it to create classes.",
                ))
            }
            SubscriptionStatus::Active => {}
        }

        let plan = self
            .billing
            .find_plan(subscription.plan_id)
            .await?
            .ok_or_else(|| {
                ServiceError::domain(
                    ErrorKind::PlanNotFound,
                    format!("Plan {} not found", subscription.plan_id),
                )
            })?;

        if plan.tier == PlanTier::Free {
            return Ok(if subscription.is_trial_active {
                ClassAdmission::allow(current, None)
            } else {
                ClassAdmission::deny(
                    current,
                    None,
                    "Your free trial has ended. Please upgrade your plan to create classes.",
                )
            });
        }

        let limit = subscription.quantity;
        if limit <= 0 {
            return Ok(ClassAdmission::deny(
                current,
                Some(limit),
                "Your plan does not include any classes. Please update your subscription.",
            ));
        }

        if current < limit {
            return Ok(ClassAdmission::allow(current, Some(limit)));
        }

        let mut reason = format!("You have reached your class limit of {} classes.", limit);
        if let Some(pending) = subscription.pending_quantity {
            reason.push_str(&format!(
                " Your plan will be reduced to {} classes at the start of the next billing period.",
                pending
            ));
        }

        tracing::info!(
            organization_id = %organization_id,
            current,
            limit,
            "Class creation denied at limit"
        );
        Ok(ClassAdmission::deny(current, Some(limit), reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Plan, Subscription};
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        service: AdmissionService,
        organization_id: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        Fixture {
            service: AdmissionService::new(store.clone()),
            store,
            organization_id: Uuid::new_v4(),
        }
    }

    fn subscribe(
        fx: &Fixture,
        tier: PlanTier,
        status: SubscriptionStatus,
        quantity: i64,
        pending_quantity: Option<i64>,
        is_trial_active: bool,
    ) {
        let plan = Plan {
            id: Uuid::new_v4(),
            name: "Plan".into(),
            tier,
        };
        fx.store
            .seed_subscription(Subscription {
                id: Uuid::new_v4(),
                organization_id: fx.organization_id,
                plan_id: plan.id,
                status,
                quantity,
                pending_quantity,
                is_trial_active,
            })
            .unwrap();
        fx.store.seed_plan(plan).unwrap();
    }

    #[tokio::test]
    async fn test_no_subscription_allows() {
        let fx = fixture();
        let admission = fx.service.can_create_class(fx.organization_id).await.unwrap();
        assert!(admission.can_create);
        assert_eq!(admission.class_limit, None);
    }

    #[tokio::test]
    async fn test_pending_subscription_denied() {
        let fx = fixture();
        subscribe(&fx, PlanTier::Paid, SubscriptionStatus::Pending, 5, None, false);
        let admission = fx.service.can_create_class(fx.organization_id).await.unwrap();
        assert!(!admission.can_create);
        assert!(admission.reason.unwrap().contains("complete your billing setup"));
    }

    #[tokio::test]
    async fn test_free_plan_follows_trial() {
        let fx = fixture();
        subscribe(&fx, PlanTier::Free, SubscriptionStatus::Active, 0, None, true);
        assert!(fx.service.can_create_class(fx.organization_id).await.unwrap().can_create);

        let expired = fixture();
        subscribe(&expired, PlanTier::Free, SubscriptionStatus::Active, 0, None, false);
        assert!(!expired
            .service
            .can_create_class(expired.organization_id)
            .await
            .unwrap()
            .can_create);
    }

    #[tokio::test]
    async fn test_paid_plan_at_limit_mentions_pending_reduction() {
        let fx = fixture();
        subscribe(&fx, PlanTier::Paid, SubscriptionStatus::Active, 5, Some(3), false);
        fx.store.set_class_count(fx.organization_id, 5).unwrap();

        let admission = fx.service.can_create_class(fx.organization_id).await.unwrap();
        assert!(!admission.can_create);
        assert_eq!(admission.current_class_count, 5);
        assert_eq!(admission.class_limit, Some(5));
        assert_eq!(
            admission.reason.as_deref(),
            Some("You have reached your class limit of 5 classes. Your plan will be reduced to 3 classes at the start of the next billing period.")
        );
    }

    #[tokio::test]
    async fn test_paid_plan_below_limit_allows() {
        let fx = fixture();
        subscribe(&fx, PlanTier::Paid, SubscriptionStatus::Active, 5, None, false);
        fx.store.set_class_count(fx.organization_id, 4).unwrap();

        let admission = fx.service.can_create_class(fx.organization_id).await.unwrap();
        assert!(admission.can_create);
        assert_eq!(admission.class_limit, Some(5));
    }

    #[tokio::test]
    async fn test_paid_plan_without_quantity_denied() {
        let fx = fixture();
        subscribe(&fx, PlanTier::Paid, SubscriptionStatus::Active, 0, None, false);
        let admission = fx.service.can_create_class(fx.organization_id).await.unwrap();
        assert!(!admission.can_create);
    }

    #[tokio::test]
    async fn test_missing_plan_is_an_error() {
        let fx = fixture();
        fx.store
            .seed_subscription(Subscription {
                id: Uuid::new_v4(),
                organization_id: fx.organization_id,
                plan_id: Uuid::new_v4(),
                status: SubscriptionStatus::Active,
                quantity: 5,
                pending_quantity: None,
                is_trial_active: false,
            })
            .unwrap();

        let err = fx
            .service
            .can_create_class(fx.organization_id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::PlanNotFound));
    }
}

mod common;

use chrono::{Duration, Utc};
use common::{FailingUnitOfWork, TestApp, PASSWORD};
use provisioning_service::{
    config::MaintenanceConfig,
    events::EventName,
    maintenance::MaintenanceWorker,
    models::SagaStatus,
    store::SagaLog,
};
use std::sync::Arc;

fn worker(app: &TestApp) -> MaintenanceWorker {
    MaintenanceWorker::new(
        app.state.backends.clone(),
        app.bus.clone(),
        MaintenanceConfig {
            interval_seconds: 60,
            compensation_grace_seconds: 600,
            max_compensation_attempts: 3,
        },
    )
}

#[tokio::test]
async fn test_lost_compensation_event_is_redriven() {
    let app = TestApp::builder()
        .unit_of_work(Arc::new(FailingUnitOfWork))
        .build();

    // The user.failed event never makes it onto the bus.
    app.bus.fail_publishes(true);
    app.sign_up("ada@example.com").await.unwrap_err();
    app.bus.fail_publishes(false);
    assert_eq!(app.store.identities().unwrap().len(), 1);

    let report = worker(&app)
        .run_once(Utc::now() + Duration::minutes(11))
        .await
        .unwrap();
    assert_eq!(report.sagas_redriven, 1);

    let redriven = app.bus.events_named(EventName::UserFailed);
    assert_eq!(redriven.len(), 1);
    let saga_id = redriven[0].saga_id();

    app.deliver_events().await;

    assert!(app.store.identities().unwrap().is_empty());
    let saga = app.store.find_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);

    // Nothing left to re-drive.
    let report = worker(&app)
        .run_once(Utc::now() + Duration::minutes(30))
        .await
        .unwrap();
    assert_eq!(report.sagas_redriven, 0);
}

#[tokio::test]
async fn test_expired_credentials_purged() {
    let app = TestApp::new();
    app.sign_up("ada@example.com").await.unwrap();
    app.state
        .strategy
        .forgot_password("ada@example.com", Utc::now())
        .await
        .unwrap();

    let report = worker(&app).run_once(Utc::now()).await.unwrap();
    assert_eq!(report.verification_tokens_purged, 0);
    assert_eq!(report.reset_tokens_purged, 0);

    let report = worker(&app)
        .run_once(Utc::now() + Duration::days(2))
        .await
        .unwrap();
    assert_eq!(report.verification_tokens_purged, 1);
    assert_eq!(report.reset_tokens_purged, 1);
}

#[tokio::test]
async fn test_expired_refresh_tokens_purged() {
    let app = TestApp::new();
    app.verified_user("ada@example.com").await;
    app.sign_in("ada@example.com", PASSWORD, None, Utc::now())
        .await
        .unwrap();

    let report = worker(&app)
        .run_once(Utc::now() + Duration::days(8))
        .await
        .unwrap();

    assert_eq!(report.refresh_tokens_purged, 1);
    assert!(app.store.refresh_tokens().unwrap().is_empty());
}

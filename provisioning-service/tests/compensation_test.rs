mod common;

use chrono::{Duration, Utc};
use common::TestApp;
use provisioning_service::{
    events::{AuthIdentityFailed, DomainEvent, EventName, UserFailed},
    models::{AuthIdentity, AuthProvider, SagaInstance, SagaKind, SagaStatus, SagaStep},
    store::{AuthIdentityRepository, SagaLog},
};
use uuid::Uuid;

async fn compensating_saga(app: &TestApp, step: SagaStep, identity: Option<Uuid>) -> SagaInstance {
    let now = Utc::now();
    let mut saga = SagaInstance::start(SagaKind::SignUp, "ada@example.com", now);
    if let Some(id) = identity {
        saga.identity_created(id, now);
    }
    saga.begin_compensation(step, "boom".into(), now);
    app.store.insert_saga(&saga).await.unwrap();
    saga
}

async fn unlinked_identity(app: &TestApp, created_at: chrono::DateTime<Utc>) -> AuthIdentity {
    let identity = AuthIdentity::new(
        AuthProvider::Local,
        "ada@example.com".into(),
        "ada@example.com",
        None,
        created_at,
    );
    app.store.insert_identity(&identity).await.unwrap();
    identity
}

fn identity_failed(saga_id: Uuid) -> DomainEvent {
    DomainEvent::AuthIdentityFailed(AuthIdentityFailed {
        saga_id,
        username: "ada@example.com".into(),
    })
}

#[tokio::test]
async fn test_half_written_identity_removed() {
    let app = TestApp::new();
    let saga = compensating_saga(&app, SagaStep::IdentityCreateFailed, None).await;
    unlinked_identity(&app, saga.created_at + Duration::milliseconds(5)).await;

    app.deliver(&identity_failed(saga.id)).await;

    assert!(app.store.identities().unwrap().is_empty());
    let saga = app.store.find_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
}

#[tokio::test]
async fn test_identity_older_than_saga_is_kept() {
    let app = TestApp::new();
    let saga = compensating_saga(&app, SagaStep::IdentityCreateFailed, None).await;
    unlinked_identity(&app, saga.created_at - Duration::days(1)).await;

    app.deliver(&identity_failed(saga.id)).await;

    assert_eq!(app.store.identities().unwrap().len(), 1);
    let saga = app.store.find_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
}

#[tokio::test]
async fn test_identity_failure_without_saga_record_deletes_nothing() {
    let app = TestApp::new();
    unlinked_identity(&app, Utc::now()).await;

    app.deliver(&identity_failed(Uuid::new_v4())).await;

    assert_eq!(app.store.identities().unwrap().len(), 1);
}

#[tokio::test]
async fn test_linked_identity_survives_stray_user_failed() {
    let app = TestApp::new();
    let outcome = app.verified_user("ada@example.com").await;
    let saga = compensating_saga(
        &app,
        SagaStep::UserCreateFailed,
        Some(outcome.auth_identity_id),
    )
    .await;

    app.deliver(&DomainEvent::UserFailed(UserFailed {
        saga_id: saga.id,
        username: "ada@example.com".into(),
        auth_identity_id: outcome.auth_identity_id,
    }))
    .await;

    assert!(app
        .store
        .find_identity_by_id(outcome.auth_identity_id)
        .await
        .unwrap()
        .is_some());
    let saga = app.store.find_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
}

#[tokio::test]
async fn test_user_failed_for_missing_identity_is_a_no_op() {
    let app = TestApp::new();
    let ghost = Uuid::new_v4();
    let saga = compensating_saga(&app, SagaStep::UserCreateFailed, Some(ghost)).await;

    app.deliver(&DomainEvent::UserFailed(UserFailed {
        saga_id: saga.id,
        username: "ada@example.com".into(),
        auth_identity_id: ghost,
    }))
    .await;

    let saga = app.store.find_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
}

#[tokio::test]
async fn test_step_without_compensation_marks_saga_failed() {
    let app = TestApp::new();
    let saga = compensating_saga(&app, SagaStep::UserCreated, None).await;

    app.deliver(&identity_failed(saga.id)).await;

    let saga = app.store.find_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::CompensationFailed);
    assert!(saga
        .error
        .unwrap_or_default()
        .starts_with("COMPENSATION_NOT_IMPLEMENTED"));
}

#[tokio::test]
async fn test_failure_event_for_completed_saga_changes_nothing() {
    let app = TestApp::new();
    let outcome = app.sign_up("ada@example.com").await.unwrap();
    let saga_id = app.bus.events_named(EventName::SignUpSucceeded)[0].saga_id();

    app.deliver(&identity_failed(saga_id)).await;
    app.deliver(&DomainEvent::UserFailed(UserFailed {
        saga_id,
        username: "ada@example.com".into(),
        auth_identity_id: outcome.auth_identity_id,
    }))
    .await;

    let saga = app.store.find_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Completed);
    assert!(saga.error.is_none());
    assert_eq!(saga.compensation_attempts, 0);
    assert_eq!(app.store.identities().unwrap().len(), 1);
}

mod common;

use chrono::Utc;
use common::{sign_up_data, FailingUnitOfWork, TestApp, PASSWORD};
use provisioning_service::{
    events::{DomainEvent, EventName},
    models::{MembershipRole, SagaStatus, SagaStep},
    services::{ErrorKind, SentEmailKind},
    store::{AuthIdentityRepository, SagaLog},
};
use std::sync::Arc;

#[tokio::test]
async fn test_sign_up_provisions_user_organization_and_owner_membership() {
    let app = TestApp::new();

    let outcome = app.sign_up("Ada@Example.com").await.unwrap();

    assert_eq!(outcome.username, "ada@example.com");
    assert!(!outcome.email_verified);
    assert!(outcome.send_verification_token);
    assert!(outcome.verification_token.is_some());

    let users = app.store.users().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].id, outcome.user_id);
    assert_eq!(users[0].email, "ada@example.com");

    let organizations = app.store.organizations().unwrap();
    assert_eq!(organizations.len(), 1);
    assert_eq!(organizations[0].name, "Ada's Organization");
    assert_eq!(organizations[0].owner_user_id, outcome.user_id);

    let memberships = app.store.memberships().unwrap();
    assert_eq!(memberships.len(), 1);
    assert_eq!(memberships[0].role, MembershipRole::Owner);
    assert_eq!(memberships[0].organization_id, outcome.organization_id);

    let identity = app
        .store
        .find_identity_by_id(outcome.auth_identity_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(identity.user_id, Some(outcome.user_id));
    assert!(!identity.is_email_verified);

    let saga = app.store.find_saga(outcome.saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(saga.step, SagaStep::OrganizationCreated);
    assert_eq!(saga.auth_identity_id, Some(outcome.auth_identity_id));
}

#[tokio::test]
async fn test_sign_up_emits_events_and_sends_verification_link() {
    let app = TestApp::new();

    let outcome = app.sign_up("ada@example.com").await.unwrap();

    let names: Vec<EventName> = app.bus.events().iter().map(DomainEvent::name).collect();
    assert_eq!(names, vec![EventName::AuthIdentityCreated, EventName::SignUpSucceeded]);

    let succeeded = app.bus.events_named(EventName::SignUpSucceeded);
    let DomainEvent::SignUpSucceeded(payload) = &succeeded[0] else {
        panic!("expected signup.succeed");
    };
    let token = outcome.verification_token.clone().unwrap();
    assert_eq!(
        payload.verification_link.as_deref(),
        Some(format!("https://app.test/auth/verify?token={}", token).as_str())
    );
    assert_eq!(payload.saga_id, outcome.saga_id);

    assert_eq!(app.deliver_events().await, 2);

    let sent = app.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, SentEmailKind::Verification);
    assert_eq!(sent[0].to, "ada@example.com");
}

#[tokio::test]
async fn test_sign_up_commit_failure_compensates_identity() {
    let app = TestApp::builder()
        .unit_of_work(Arc::new(FailingUnitOfWork))
        .build();

    let err = app.sign_up("ada@example.com").await.unwrap_err();
    assert!(!err.is_domain());
    assert_eq!(err.code(), "DATABASE_ERROR");

    // Identity was written before the failing commit.
    assert_eq!(app.store.identities().unwrap().len(), 1);
    assert!(app.store.users().unwrap().is_empty());

    let failed = app.bus.events_named(EventName::UserFailed);
    assert_eq!(failed.len(), 1);
    let saga_id = failed[0].saga_id();

    let saga = app.store.find_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensating);
    assert_eq!(saga.step, SagaStep::UserCreateFailed);

    app.deliver_events().await;

    assert!(app.store.identities().unwrap().is_empty());
    let saga = app.store.find_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert!(app.mailer.sent().is_empty());
}

#[tokio::test]
async fn test_compensation_is_idempotent_under_redelivery() {
    let app = TestApp::builder()
        .unit_of_work(Arc::new(FailingUnitOfWork))
        .build();

    app.sign_up("ada@example.com").await.unwrap_err();
    let failed = app.bus.events_named(EventName::UserFailed).remove(0);

    app.deliver(&failed).await;
    app.deliver(&failed).await;

    assert!(app.store.identities().unwrap().is_empty());
    let saga = app.store.find_saga(failed.saga_id()).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
}

#[tokio::test]
async fn test_duplicate_email_fails_without_compensation() {
    let app = TestApp::new();
    app.sign_up("ada@example.com").await.unwrap();
    app.bus.clear();

    let err = app.sign_up("ADA@example.com").await.unwrap_err();

    assert_eq!(err.kind(), Some(ErrorKind::EmailAlreadyExists));
    assert!(app.bus.events().is_empty());
    assert_eq!(app.store.identities().unwrap().len(), 1);
    assert_eq!(app.store.users().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_input_rejected_before_saga_starts() {
    let app = TestApp::new();

    let err = app
        .state
        .sign_up
        .execute(sign_up_data("Ada", "Lovelace", "not-an-email", PASSWORD), Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ValidationFailed));

    let err = app
        .state
        .sign_up
        .execute(
            sign_up_data("Ada", "Lovelace", "ada@example.com", "short"),
            Utc::now(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::WeakPassword));

    let err = app
        .state
        .sign_up
        .execute(sign_up_data("", "Lovelace", "ada@example.com", PASSWORD), Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ValidationFailed));

    assert!(app.store.identities().unwrap().is_empty());
    assert!(app.bus.events().is_empty());
}

#[tokio::test]
async fn test_publish_failure_does_not_fail_sign_up() {
    let app = TestApp::new();
    app.bus.fail_publishes(true);

    let outcome = app.sign_up("ada@example.com").await.unwrap();

    assert!(app.bus.events().is_empty());
    let saga = app.store.find_saga(outcome.saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Completed);
}

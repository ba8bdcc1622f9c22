mod common;

use chrono::{Duration, Utc};
use common::{client, FailingUnitOfWork, TestApp, PASSWORD};
use provisioning_service::{
    models::UserStatus,
    services::ErrorKind,
    store::AuthIdentityRepository,
    strategy::{ConfirmSignUpRequest, Credential, SignInRequest},
    utils::Password,
};
use std::sync::Arc;

#[tokio::test]
async fn test_sign_in_issues_session_and_resets_counter() {
    let app = TestApp::new();
    let outcome = app.verified_user("ada@example.com").await;

    app.sign_in("ada@example.com", "Wr0ng!Guess", None, Utc::now())
        .await
        .unwrap_err();

    let tokens = app
        .sign_in("ADA@example.com", PASSWORD, None, Utc::now())
        .await
        .unwrap();
    assert_eq!(tokens.user_id, outcome.user_id);
    assert_eq!(tokens.token_type, "Bearer");

    let claims = app.state.sessions.verify_access_token(&tokens.access_token).unwrap();
    assert_eq!(claims.sub, outcome.user_id.to_string());

    let identity = app
        .store
        .find_identity_by_id(outcome.auth_identity_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(identity.failed_login_attempts, 0);
    assert!(identity.last_login_at.is_some());
}

#[tokio::test]
async fn test_unknown_account_and_unverified_email() {
    let app = TestApp::new();

    let err = app
        .sign_in("nobody@example.com", PASSWORD, None, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::InvalidCredentials));

    app.sign_up("ada@example.com").await.unwrap();
    let err = app
        .sign_in("ada@example.com", PASSWORD, None, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::EmailNotVerified));
}

#[tokio::test]
async fn test_five_failures_lock_the_account() {
    let app = TestApp::new();
    app.verified_user("ada@example.com").await;
    let now = Utc::now();

    for remaining in (1..=4).rev() {
        let err = app
            .sign_in("ada@example.com", "Wr0ng!Guess", None, now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidCredentials));
        assert!(
            err.to_string().contains(&format!("{} attempt", remaining)),
            "unexpected message: {}",
            err
        );
    }

    let err = app
        .sign_in("ada@example.com", "Wr0ng!Guess", None, now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::AccountLocked));
    assert!(err.to_string().contains("30 minutes"));

    // The right password does not get through a live lock.
    let err = app
        .sign_in("ada@example.com", PASSWORD, None, now + Duration::minutes(10))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::AccountLocked));
    assert!(err.to_string().contains("20 minutes"));
}

#[tokio::test]
async fn test_lock_expires_lazily() {
    let app = TestApp::new();
    let outcome = app.verified_user("ada@example.com").await;
    let now = Utc::now();

    for _ in 0..5 {
        app.sign_in("ada@example.com", "Wr0ng!Guess", None, now)
            .await
            .unwrap_err();
    }

    let later = now + Duration::minutes(31);
    let err = app
        .sign_in("ada@example.com", "Wr0ng!Guess", None, later)
        .await
        .unwrap_err();
    // Counter started over once the lock lapsed.
    assert_eq!(err.kind(), Some(ErrorKind::InvalidCredentials));
    assert!(err.to_string().contains("4 attempts remaining"));

    app.sign_in("ada@example.com", PASSWORD, None, later)
        .await
        .unwrap();

    let identity = app
        .store
        .find_identity_by_id(outcome.auth_identity_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!identity.is_locked);
    assert_eq!(identity.locked_until, None);
    assert_eq!(identity.failed_login_attempts, 0);
}

#[tokio::test]
async fn test_suspended_and_deleted_users_cannot_sign_in() {
    let app = TestApp::new();
    let outcome = app.verified_user("ada@example.com").await;

    app.store
        .set_user_status(outcome.user_id, UserStatus::Suspended)
        .unwrap();
    let err = app
        .sign_in("ada@example.com", PASSWORD, None, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::UserAccountSuspended));

    app.store
        .set_user_status(outcome.user_id, UserStatus::Deleted)
        .unwrap();
    let err = app
        .sign_in("ada@example.com", PASSWORD, None, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::UserAccountDeleted));
}

#[tokio::test]
async fn test_identity_without_user_is_not_provisioned() {
    let app = TestApp::builder()
        .unit_of_work(Arc::new(FailingUnitOfWork))
        .build();
    app.sign_up("ada@example.com").await.unwrap_err();

    // Verify the orphan before compensation runs.
    let resent = app
        .state
        .strategy
        .resend_confirmation_code("ada@example.com", Utc::now())
        .await
        .unwrap();
    app.state
        .strategy
        .confirm_sign_up(
            &ConfirmSignUpRequest {
                code: resent.verification_token.unwrap(),
                username: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();

    let err = app
        .sign_in("ada@example.com", PASSWORD, None, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::AccountNotProvisioned));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_wrong_passwords_each_count() {
    let app = TestApp::new();
    let outcome = app.verified_user("ada@example.com").await;
    let now = Utc::now();

    let mut attempts = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let strategy = app.state.strategy.clone();
        attempts.spawn(async move {
            strategy
                .sign_in(
                    &SignInRequest {
                        username: "ada@example.com".to_string(),
                        credential: Credential::Password(Password::new("Wr0ng!Guess")),
                        client: client(None),
                    },
                    now,
                )
                .await
        });
    }

    while let Some(result) = attempts.join_next().await {
        let err = result.unwrap().unwrap_err();
        assert!(
            matches!(
                err.kind(),
                Some(ErrorKind::InvalidCredentials) | Some(ErrorKind::AccountLocked)
            ),
            "unexpected error: {} ({})",
            err,
            err.code()
        );
    }

    let identity = app
        .store
        .find_identity_by_id(outcome.auth_identity_id)
        .await
        .unwrap()
        .unwrap();
    assert!(identity.is_locked);
    assert_eq!(identity.failed_login_attempts, 5);

    let err = app
        .sign_in("ada@example.com", PASSWORD, None, now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::AccountLocked));
}

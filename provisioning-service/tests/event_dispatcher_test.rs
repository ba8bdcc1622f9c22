mod common;

use chrono::Utc;
use common::{sign_up_data, test_config, FailingUnitOfWork, PASSWORD};
use provisioning_service::{
    events::{EventDispatcher, InProcessEventBus},
    services::{MockEmailService, SentEmailKind},
    store::{Backends, MemoryStore, SagaLog},
    strategy::AuthProviderKind,
    AppState,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    store: Arc<MemoryStore>,
    mailer: Arc<MockEmailService>,
    state: AppState,
    shutdown: CancellationToken,
    dispatcher: JoinHandle<()>,
}

fn start(failing_commit: bool) -> Running {
    let store = Arc::new(MemoryStore::new());
    let mut backends = Backends::from_store(store.clone());
    if failing_commit {
        backends.unit_of_work = Arc::new(FailingUnitOfWork);
    }

    let (bus, rx) = InProcessEventBus::new(16);
    let state = AppState::with_clients(
        test_config(AuthProviderKind::Local),
        backends,
        Arc::new(bus),
        None,
        None,
    )
    .unwrap();

    let mailer = Arc::new(MockEmailService::new());
    let shutdown = CancellationToken::new();
    let mut dispatcher = EventDispatcher::new(rx, shutdown.clone());
    for handler in state.event_handlers(mailer.clone()) {
        dispatcher.subscribe(handler);
    }

    Running {
        store,
        mailer,
        state,
        shutdown,
        dispatcher: tokio::spawn(dispatcher.run()),
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn test_sign_up_mail_delivered_through_dispatcher() {
    let running = start(false);

    running
        .state
        .sign_up
        .execute(
            sign_up_data("Ada", "Lovelace", "ada@example.com", PASSWORD),
            Utc::now(),
        )
        .await
        .unwrap();

    let mailer = running.mailer.clone();
    eventually(|| {
        let mailer = mailer.clone();
        async move { !mailer.sent().is_empty() }
    })
    .await;
    assert_eq!(running.mailer.sent()[0].kind, SentEmailKind::Verification);

    running.shutdown.cancel();
    running.dispatcher.await.unwrap();
}

#[tokio::test]
async fn test_compensation_runs_asynchronously() {
    let running = start(true);

    running
        .state
        .sign_up
        .execute(
            sign_up_data("Ada", "Lovelace", "ada@example.com", PASSWORD),
            Utc::now(),
        )
        .await
        .unwrap_err();

    let store = running.store.clone();
    eventually(|| {
        let store = store.clone();
        async move { store.identities().unwrap().is_empty() }
    })
    .await;

    // Nothing is left waiting for compensation.
    let store = running.store.clone();
    eventually(|| {
        let store = store.clone();
        async move {
            store
                .list_stalled_sagas(Utc::now() + chrono::Duration::days(1))
                .await
                .map(|sagas| sagas.is_empty())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(running.store.users().unwrap().is_empty());

    running.shutdown.cancel();
    running.dispatcher.await.unwrap();
}

#[tokio::test]
async fn test_dispatcher_stops_when_every_sender_is_gone() {
    let Running {
        state, dispatcher, ..
    } = start(false);

    drop(state);
    tokio::time::timeout(Duration::from_secs(5), dispatcher)
        .await
        .expect("dispatcher did not stop")
        .unwrap();
}

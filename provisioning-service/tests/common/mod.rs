//! Test helpers for provisioning-service integration tests.
//!
//! Everything runs against `MemoryStore`; events are recorded and delivered
//! explicitly with [`TestApp::deliver_events`] so each test controls when
//! asynchronous handlers run.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provisioning_service::{
    config::{
        CredentialsConfig, DatabaseConfig, EmailConfig, Environment, EventsConfig,
        HashingConfig, JwtConfig, MaintenanceConfig, ProvisioningConfig,
    },
    events::{DomainEvent, EventHandler, RecordingEventBus},
    saga::{SignUpData, SignUpOutcome},
    services::{ClientInfo, MockEmailService, PasswordPolicy, ServiceError, SessionTokens},
    store::{Backends, ChangeSet, MemoryStore, UnitOfWork},
    strategy::{
        AuthProviderKind, ConfirmSignUpRequest, Credential, IdentityProviderClient, OAuthClient,
        SignInRequest,
    },
    utils::Password,
    AppState,
};
use service_core::error::AppError;
use std::sync::Arc;

pub const PASSWORD: &str = "Tr4il!Mix9Zp";
pub const NEW_PASSWORD: &str = "Gl4cier-Fjord!";
pub const CHROME_ON_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
pub const FIREFOX_ON_LINUX: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0";

pub fn test_config(auth_provider: AuthProviderKind) -> ProvisioningConfig {
    ProvisioningConfig {
        common: service_core::config::Config {
            service_name: "provisioning-service-test".to_string(),
            log_level: "debug".to_string(),
            otlp_endpoint: None,
        },
        environment: Environment::Dev,
        service_version: "test".to_string(),
        public_base_url: "https://app.test".to_string(),
        database: DatabaseConfig {
            url: "postgres://localhost/provisioning_test".to_string(),
            max_connections: 1,
            min_connections: 1,
        },
        jwt: JwtConfig {
            signing_secret: "test-signing-secret-that-is-long-enough".to_string(),
            issuer: "provisioning-test".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        },
        credentials: CredentialsConfig::default(),
        password_policy: PasswordPolicy::default(),
        // Cheap Argon2 parameters keep the suite fast.
        hashing: HashingConfig {
            memory_kib: 4096,
            iterations: 1,
            parallelism: 1,
        },
        auth_provider,
        external_idp: None,
        google: None,
        email: EmailConfig {
            smtp_host: "localhost".to_string(),
            smtp_port: 1025,
            smtp_username: String::new(),
            smtp_password: String::new(),
            from_address: "no-reply@app.test".to_string(),
        },
        events: EventsConfig::default(),
        maintenance: MaintenanceConfig::default(),
    }
}

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<RecordingEventBus>,
    pub mailer: Arc<MockEmailService>,
    pub state: AppState,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> TestAppBuilder {
        TestAppBuilder::default()
    }

    /// Hand every recorded event to the subscribed handlers, as the
    /// dispatcher would. Returns how many events were delivered.
    pub async fn deliver_events(&self) -> usize {
        let events = self.bus.events();
        self.bus.clear();

        for event in &events {
            self.deliver(event).await;
        }
        events.len()
    }

    pub async fn deliver(&self, event: &DomainEvent) {
        for handler in self
            .handlers
            .iter()
            .filter(|h| h.subscribes_to() == event.name())
        {
            handler.handle(event).await;
        }
    }

    pub async fn sign_up(&self, email: &str) -> Result<SignUpOutcome, ServiceError> {
        self.state
            .sign_up
            .execute(sign_up_data("Ada", "Lovelace", email, PASSWORD), Utc::now())
            .await
    }

    /// Signed up and email confirmed, ready to sign in.
    pub async fn verified_user(&self, email: &str) -> SignUpOutcome {
        let outcome = self.sign_up(email).await.unwrap();
        let token = outcome.verification_token.clone().unwrap();
        self.state
            .strategy
            .confirm_sign_up(
                &ConfirmSignUpRequest {
                    code: token,
                    username: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        outcome
    }

    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
        user_agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError> {
        self.state
            .strategy
            .sign_in(
                &SignInRequest {
                    username: email.to_string(),
                    credential: Credential::Password(Password::new(password)),
                    client: client(user_agent),
                },
                now,
            )
            .await
    }
}

#[derive(Default)]
pub struct TestAppBuilder {
    provider: Option<AuthProviderKind>,
    unit_of_work: Option<Arc<dyn UnitOfWork>>,
    identity_provider: Option<Arc<dyn IdentityProviderClient>>,
    oauth: Option<Arc<dyn OAuthClient>>,
    store: Option<Arc<MemoryStore>>,
}

impl TestAppBuilder {
    pub fn unit_of_work(mut self, unit_of_work: Arc<dyn UnitOfWork>) -> Self {
        self.unit_of_work = Some(unit_of_work);
        self
    }

    pub fn store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn identity_provider(mut self, client: Arc<dyn IdentityProviderClient>) -> Self {
        self.provider = Some(AuthProviderKind::ExternalIdp);
        self.identity_provider = Some(client);
        self
    }

    pub fn oauth(mut self, client: Arc<dyn OAuthClient>) -> Self {
        self.provider = Some(AuthProviderKind::Google);
        self.oauth = Some(client);
        self
    }

    pub fn build(self) -> TestApp {
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let mut backends = Backends::from_store(store.clone());
        if let Some(unit_of_work) = self.unit_of_work {
            backends.unit_of_work = unit_of_work;
        }

        let bus = Arc::new(RecordingEventBus::new());
        let mailer = Arc::new(MockEmailService::new());
        let config = test_config(self.provider.unwrap_or(AuthProviderKind::Local));

        let state = AppState::with_clients(
            config,
            backends,
            bus.clone(),
            self.identity_provider,
            self.oauth,
        )
        .expect("Failed to build app state");
        let handlers = state.event_handlers(mailer.clone());

        TestApp {
            store,
            bus,
            mailer,
            state,
            handlers,
        }
    }
}

pub fn sign_up_data(first_name: &str, last_name: &str, email: &str, password: &str) -> SignUpData {
    SignUpData {
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        email: email.to_string(),
        credential: Credential::Password(Password::new(password)),
    }
}

pub fn client(user_agent: Option<&str>) -> ClientInfo {
    ClientInfo {
        user_agent: user_agent.map(str::to_string),
        ip_address: Some("203.0.113.7".to_string()),
    }
}

/// Unit of work whose commit always fails like a dropped connection.
pub struct FailingUnitOfWork;

#[async_trait]
impl UnitOfWork for FailingUnitOfWork {
    async fn commit(&self, _changes: ChangeSet, _now: DateTime<Utc>) -> Result<(), AppError> {
        Err(AppError::DatabaseError(anyhow::anyhow!(
            "connection reset by peer"
        )))
    }
}

pub mod compensation;
pub mod config;
pub mod db;
pub mod events;
pub mod maintenance;
pub mod models;
pub mod notifications;
pub mod saga;
pub mod services;
pub mod store;
pub mod strategy;
pub mod utils;

use service_core::error::AppError;
use std::sync::Arc;

use crate::compensation::{AuthIdentityFailedHandler, UserFailedHandler};
use crate::config::ProvisioningConfig;
use crate::events::{EventBus, EventHandler};
use crate::notifications::{VerificationEmailHandler, WelcomeEmailHandler};
use crate::saga::{InvitationSignUpSaga, SagaDeps, SignUpSaga};
use crate::services::{AdmissionService, EmailProvider, JwtService, SessionService};
use crate::store::Backends;
use crate::strategy::{
    resolve_strategy, AuthStrategy, GoogleOAuthClient, HttpIdentityProviderClient,
    IdentityProviderClient, OAuthClient, StrategyDeps,
};
use crate::utils::CredentialHasher;

/// Everything a transport layer needs to serve requests.
#[derive(Clone)]
pub struct AppState {
    pub config: ProvisioningConfig,
    pub backends: Backends,
    pub events: Arc<dyn EventBus>,
    pub strategy: Arc<dyn AuthStrategy>,
    pub sessions: SessionService,
    pub admission: AdmissionService,
    pub sign_up: SignUpSaga,
    pub invitation_sign_up: InvitationSignUpSaga,
}

impl AppState {
    /// Build with the HTTP provider clients the configuration asks for.
    pub fn new(
        config: ProvisioningConfig,
        backends: Backends,
        events: Arc<dyn EventBus>,
    ) -> Result<Self, AppError> {
        let identity_provider = match &config.external_idp {
            Some(idp) => Some(
                Arc::new(HttpIdentityProviderClient::new(idp)?) as Arc<dyn IdentityProviderClient>
            ),
            None => None,
        };
        let oauth = config
            .google
            .as_ref()
            .map(|google| Arc::new(GoogleOAuthClient::new(google)) as Arc<dyn OAuthClient>);

        Self::with_clients(config, backends, events, identity_provider, oauth)
    }

    pub fn with_clients(
        config: ProvisioningConfig,
        backends: Backends,
        events: Arc<dyn EventBus>,
        identity_provider: Option<Arc<dyn IdentityProviderClient>>,
        oauth: Option<Arc<dyn OAuthClient>>,
    ) -> Result<Self, AppError> {
        let jwt = JwtService::new(&config.jwt).map_err(AppError::ConfigError)?;
        let sessions = SessionService::new(
            backends.refresh_tokens.clone(),
            backends.directory.clone(),
            jwt,
            config.credentials.max_active_sessions,
        );

        let strategy = resolve_strategy(
            config.auth_provider,
            StrategyDeps {
                backends: backends.clone(),
                sessions: sessions.clone(),
                hasher: CredentialHasher::new(&config.hashing)?,
                credentials: config.credentials.clone(),
                password_policy: config.password_policy.clone(),
                identity_provider,
                oauth,
            },
        )?;

        let saga_deps = SagaDeps {
            backends: backends.clone(),
            strategy: strategy.clone(),
            events: events.clone(),
            password_policy: config.password_policy.clone(),
            public_base_url: config.public_base_url.clone(),
        };

        Ok(Self {
            admission: AdmissionService::new(backends.billing.clone()),
            sign_up: SignUpSaga::new(saga_deps.clone()),
            invitation_sign_up: InvitationSignUpSaga::new(saga_deps),
            config,
            backends,
            events,
            strategy,
            sessions,
        })
    }

    /// Subscribers for the event dispatcher: compensation plus mail.
    pub fn event_handlers(&self, email: Arc<dyn EmailProvider>) -> Vec<Arc<dyn EventHandler>> {
        vec![
            Arc::new(UserFailedHandler::new(
                self.backends.clone(),
                self.strategy.clone(),
            )),
            Arc::new(AuthIdentityFailedHandler::new(
                self.backends.clone(),
                self.strategy.clone(),
            )),
            Arc::new(VerificationEmailHandler::new(email.clone())),
            Arc::new(WelcomeEmailHandler::new(
                email,
                self.backends.directory.clone(),
            )),
        ]
    }
}

use provisioning_service::{
    config::ProvisioningConfig,
    db,
    events::{EventDispatcher, InProcessEventBus},
    maintenance::MaintenanceWorker,
    services::EmailService,
    store::{Backends, Database},
    AppState,
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = ProvisioningConfig::from_env()?;

    init_tracing(
        &config.common.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    )?;

    tracing::info!(
        service = %config.common.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        auth_provider = ?config.auth_provider,
        "Starting provisioning service"
    );

    let pool = db::connect(&config.database).await?;

    let database = Arc::new(Database::new(pool));
    database.health_check().await?;
    let backends = Backends::from_store(database);

    let email = Arc::new(EmailService::new(&config.email)?);

    let (bus, event_rx) = InProcessEventBus::new(config.events.queue_capacity);
    let maintenance_config = config.maintenance.clone();
    let state = AppState::new(config, backends, Arc::new(bus.clone()))?;

    let shutdown = CancellationToken::new();

    let mut dispatcher = EventDispatcher::new(event_rx, shutdown.clone());
    for handler in state.event_handlers(email) {
        dispatcher.subscribe(handler);
    }
    let dispatcher_task = tokio::spawn(dispatcher.run());

    let maintenance = MaintenanceWorker::new(
        state.backends.clone(),
        state.events.clone(),
        maintenance_config,
    );
    let maintenance_task = tokio::spawn(maintenance.run(shutdown.clone()));

    tracing::info!("Provisioning service ready");
    shutdown_signal().await;

    shutdown.cancel();
    drop(state);
    drop(bus);

    if let Err(e) = dispatcher_task.await {
        tracing::error!(error = %e, "Event dispatcher task failed");
    }
    if let Err(e) = maintenance_task.await {
        tracing::error!(error = %e, "Maintenance task failed");
    }

    tracing::info!("Provisioning service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining");
}

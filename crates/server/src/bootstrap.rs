use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use waypoint_core::audit::AuditLog;
use waypoint_core::authz::AuthorizationGate;
use waypoint_core::booking::{BookingExecutor, SandboxProvider};
use waypoint_core::config::{AppConfig, ConfigError, ProviderKind};
use waypoint_core::lifecycle::LifecycleEngine;
use waypoint_db::{
    connect_with_settings, migrations, DbPool, SqlAuditStore, SqlBookingStore, SqlOutboxSink,
    SqlRequestStore,
};

use crate::api::AppState;
use crate::provider::HttpBookingProvider;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub state: AppState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let state = wire_services(&config, &db_pool)?;
    info!(
        event_name = "system.bootstrap.services_ready",
        correlation_id = "bootstrap",
        booking_providers = ?state.bookings.provider_names(),
        default_provider = config.booking.provider.as_str(),
        "lifecycle engine and booking executor ready"
    );

    Ok(Application { config, db_pool, state })
}

fn wire_services(config: &AppConfig, db_pool: &DbPool) -> Result<AppState, BootstrapError> {
    let gate = AuthorizationGate::new(config.role_registry()?);
    let store_timeout = Duration::from_millis(config.lifecycle.store_timeout_ms);
    let outbox = Arc::new(SqlOutboxSink::new(db_pool.clone()));
    let audit = AuditLog::new(
        Arc::new(SqlAuditStore::new(db_pool.clone())),
        gate.clone(),
        store_timeout,
    );

    let requests = Arc::new(SqlRequestStore::new(db_pool.clone()));
    let engine = LifecycleEngine::new(
        requests.clone(),
        audit.clone(),
        outbox.clone(),
        gate.clone(),
        config.lifecycle_config(),
    );

    let mut bookings = BookingExecutor::new(
        Arc::new(SqlBookingStore::new(db_pool.clone())),
        requests,
        audit.clone(),
        outbox,
        gate,
        config.booking_config(),
    )
    .with_provider(Arc::new(SandboxProvider));
    if config.booking.provider == ProviderKind::Http {
        let base_url = config.booking.base_url.as_deref().unwrap_or_default();
        bookings = bookings.with_provider(Arc::new(HttpBookingProvider::new(
            base_url,
            config.booking.api_key.clone(),
            Duration::from_millis(config.booking.timeout_ms),
        )));
    }

    Ok(AppState { engine, bookings, audit })
}

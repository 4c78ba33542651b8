use std::sync::Arc;

use courier_core::config::{AppConfig, ConfigError, LoadOptions};
use courier_core::errors::ConfigurationError;
use courier_core::providers::sandbox::register_sandbox;
use courier_core::providers::ProviderRegistry;
use courier_core::state_machine::{ActionStateMachine, RetryPolicy};
use courier_db::repositories::{
    SqlActionLogRepository, SqlIdempotencyRepository, SqlLeaseRepository, SqlTenantRepository,
};
use courier_db::{connect_with_settings, migrations, DbPool};
use courier_dispatch::{
    ActionDispatcher, ExpirySweeper, GuardSettings, IdempotencyGuard, SweeperSettings,
};
use thiserror::Error;
use tracing::info;

use crate::api::AppState;
use crate::webhook::register_webhook;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub state: AppState,
    pub sweeper: Arc<ExpirySweeper>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("provider registration failed: {0}")]
    Registry(#[from] ConfigurationError),
}

/// Startup registration table. Every provider a tenant may name is listed here.
pub fn build_registry(config: &AppConfig) -> Result<ProviderRegistry, ConfigurationError> {
    let mut registry = ProviderRegistry::new();
    register_sandbox(&mut registry)?;
    register_webhook(&mut registry, &config.webhook)?;
    Ok(registry)
}

#[cfg_attr(not(test), allow(dead_code))]
pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
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

    let registry = build_registry(&config)?;
    let status = registry.status();
    info!(
        event_name = "system.bootstrap.providers_registered",
        correlation_id = "bootstrap",
        total_providers = status.total_providers,
        "provider registry populated"
    );

    let idempotency = Arc::new(SqlIdempotencyRepository::new(db_pool.clone()));
    let action_logs = Arc::new(SqlActionLogRepository::new(db_pool.clone()));
    let dispatcher = ActionDispatcher::new(
        registry,
        IdempotencyGuard::new(idempotency.clone(), GuardSettings::from(&config.idempotency)),
        action_logs.clone(),
        ActionStateMachine::new(RetryPolicy::from(&config.dispatch)),
    );

    let sweeper = Arc::new(ExpirySweeper::new(
        idempotency,
        Arc::new(SqlLeaseRepository::new(db_pool.clone())),
        SweeperSettings::from(&config.sweeper),
    ));

    let state = AppState {
        dispatcher,
        tenants: Arc::new(SqlTenantRepository::new(db_pool.clone())),
        action_logs,
    };

    Ok(Application { config, db_pool, state, sweeper })
}

#[cfg(test)]
mod tests {
    use courier_core::config::{ConfigOverrides, LoadOptions};
    use courier_core::domain::action::ProviderCategory;

    use crate::bootstrap::bootstrap;

    #[tokio::test]
    async fn bootstrap_migrates_and_registers_builtin_providers() {
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:?cache=shared".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap should succeed with an in-memory database");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' \
             AND name IN ('tenants', 'idempotency_keys', 'action_logs', 'sweeper_leases')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("count tables");
        assert_eq!(table_count, 4);

        let registry = app.state.dispatcher.registry();
        assert!(registry.is_registered(ProviderCategory::Crm, "sandbox"));
        assert!(registry.is_registered(ProviderCategory::Email, "webhook"));

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_database_url() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("postgres://localhost/courier".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        assert!(result.is_err());
    }
}

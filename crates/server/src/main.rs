mod api;
mod bootstrap;
mod health;
mod webhook;

use std::time::Duration;

use anyhow::Result;
use axum::Router;
use courier_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use courier_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let sweeper_task = if app.config.sweeper.enabled {
        let sweeper = app.sweeper.clone();
        Some(tokio::spawn(async move { sweeper.run().await }))
    } else {
        tracing::info!(
            event_name = "system.server.sweeper_disabled",
            correlation_id = "bootstrap",
            "expiry sweeper disabled by configuration"
        );
        None
    };

    let health_state = health::HealthState {
        db_pool: app.db_pool.clone(),
        providers: app.state.dispatcher.registry().status(),
    };
    let router = Router::new()
        .merge(health::router(health_state))
        .merge(api::router(app.state.clone()));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "courier-server listening"
    );

    axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "courier-server stopping"
    );

    app.sweeper.shutdown_handle().request();
    if let Some(task) = sweeper_task {
        let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
        if tokio::time::timeout(grace, task).await.is_err() {
            tracing::warn!(
                event_name = "system.server.sweeper_timeout",
                correlation_id = "shutdown",
                "expiry sweeper did not stop within the grace period"
            );
        }
    }

    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(signal_error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %signal_error,
            "failed to listen for shutdown signal"
        );
    }
}

pub mod config;
pub mod doctor;
pub mod migrate;
pub mod seed;
pub mod sweep;

use courier_core::config::{AppConfig, LoadOptions};
use courier_db::{connect_with_settings, migrations, DbPool};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with_details(command, message, None)
    }

    pub fn success_with_details(
        command: &str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            details,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            details: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

/// `(error_class, message, exit_code)` carried out of a command's async block.
pub(crate) type StepError = (&'static str, String, u8);

/// Loads config, opens a migrated pool on a current-thread runtime and runs
/// `step` against it. Exit codes: 2 config, 3 runtime, 4 connect, 5 migrate.
pub(crate) fn with_migrated_pool<T, F, Fut>(command: &str, step: F) -> Result<T, CommandResult>
where
    F: FnOnce(AppConfig, DbPool) -> Fut,
    Fut: std::future::Future<Output = Result<T, StepError>>,
{
    let config = AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|error| {
            CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            )
        })?;

    runtime
        .block_on(async {
            let pool = connect_with_settings(
                &config.database.url,
                config.database.max_connections,
                config.database.timeout_secs,
            )
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
            migrations::run_pending(&pool)
                .await
                .map_err(|error| ("migration", error.to_string(), 5u8))?;

            let result = step(config, pool.clone()).await;
            pool.close().await;
            result
        })
        .map_err(|(error_class, message, exit_code)| {
            CommandResult::failure(command, error_class, message, exit_code)
        })
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\
             \"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

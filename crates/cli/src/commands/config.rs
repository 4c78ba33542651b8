use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use courier_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let webhook_token = config
        .webhook
        .token
        .as_ref()
        .map(|token| redact_token(token.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    let fields = vec![
        field("database.url", config.database.url.clone(), &["COURIER_DATABASE_URL"]),
        field(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["COURIER_DATABASE_MAX_CONNECTIONS"],
        ),
        field(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["COURIER_DATABASE_TIMEOUT_SECS"],
        ),
        field(
            "server.bind_address",
            config.server.bind_address.clone(),
            &["COURIER_SERVER_BIND_ADDRESS"],
        ),
        field("server.port", config.server.port.to_string(), &["COURIER_SERVER_PORT"]),
        field(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            &["COURIER_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        field(
            "dispatch.max_retries",
            config.dispatch.max_retries.to_string(),
            &["COURIER_DISPATCH_MAX_RETRIES"],
        ),
        field(
            "dispatch.retry_base_delay_ms",
            config.dispatch.retry_base_delay_ms.to_string(),
            &["COURIER_DISPATCH_RETRY_BASE_DELAY_MS"],
        ),
        field(
            "dispatch.retry_max_delay_ms",
            config.dispatch.retry_max_delay_ms.to_string(),
            &["COURIER_DISPATCH_RETRY_MAX_DELAY_MS"],
        ),
        field(
            "dispatch.attempt_timeout_ms",
            config.dispatch.attempt_timeout_ms.to_string(),
            &["COURIER_DISPATCH_ATTEMPT_TIMEOUT_MS"],
        ),
        field(
            "idempotency.ttl_secs",
            config.idempotency.ttl_secs.to_string(),
            &["COURIER_IDEMPOTENCY_TTL_SECS"],
        ),
        field(
            "idempotency.wait_timeout_ms",
            config.idempotency.wait_timeout_ms.to_string(),
            &["COURIER_IDEMPOTENCY_WAIT_TIMEOUT_MS"],
        ),
        field(
            "idempotency.poll_interval_ms",
            config.idempotency.poll_interval_ms.to_string(),
            &["COURIER_IDEMPOTENCY_POLL_INTERVAL_MS"],
        ),
        field("sweeper.enabled", config.sweeper.enabled.to_string(), &["COURIER_SWEEPER_ENABLED"]),
        field(
            "sweeper.interval_secs",
            config.sweeper.interval_secs.to_string(),
            &["COURIER_SWEEPER_INTERVAL_SECS"],
        ),
        field(
            "sweeper.batch_size",
            config.sweeper.batch_size.to_string(),
            &["COURIER_SWEEPER_BATCH_SIZE"],
        ),
        field(
            "sweeper.max_batches",
            config.sweeper.max_batches.to_string(),
            &["COURIER_SWEEPER_MAX_BATCHES"],
        ),
        field(
            "sweeper.lease_secs",
            config.sweeper.lease_secs.to_string(),
            &["COURIER_SWEEPER_LEASE_SECS"],
        ),
        field("webhook.token", webhook_token, &["COURIER_WEBHOOK_TOKEN"]),
        field(
            "webhook.timeout_secs",
            config.webhook.timeout_secs.to_string(),
            &["COURIER_WEBHOOK_TIMEOUT_SECS"],
        ),
        field(
            "logging.level",
            config.logging.level.clone(),
            &["COURIER_LOGGING_LEVEL", "COURIER_LOG_LEVEL"],
        ),
        field(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["COURIER_LOGGING_FORMAT", "COURIER_LOG_FORMAT"],
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, value, env_keys) in fields {
        let source = field_source(
            key_path,
            env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(key_path, &value, source));
    }

    lines.join("\n")
}

fn field(
    key_path: &'static str,
    value: String,
    env_keys: &'static [&'static str],
) -> (&'static str, String, &'static [&'static str]) {
    (key_path, value, env_keys)
}

fn detect_config_path() -> Option<PathBuf> {
    ["courier.toml", "config/courier.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a short prefix so operators can tell tokens apart without exposing them.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    match trimmed.split_once('_') {
        Some((prefix, _)) if prefix.len() <= 8 => format!("{prefix}_***"),
        _ => "<redacted>".to_string(),
    }
}

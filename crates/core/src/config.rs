use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub dispatch: DispatchConfig,
    pub idempotency: IdempotencyConfig,
    pub sweeper: SweeperConfig,
    pub webhook: WebhookConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub attempt_timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
    /// How long a request waits on an in-flight duplicate before giving up.
    pub wait_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: u32,
    pub max_batches: u32,
    pub lease_secs: u64,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    /// Bearer token sent to webhook providers that do not carry their own.
    pub token: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub sweeper_enabled: Option<bool>,
    pub webhook_token: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://courier.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            dispatch: DispatchConfig {
                max_retries: 3,
                retry_base_delay_ms: 200,
                retry_max_delay_ms: 5_000,
                attempt_timeout_ms: 10_000,
            },
            idempotency: IdempotencyConfig {
                ttl_secs: 86_400,
                wait_timeout_ms: 5_000,
                poll_interval_ms: 50,
            },
            sweeper: SweeperConfig {
                enabled: true,
                interval_secs: 60,
                batch_size: 500,
                max_batches: 10,
                lease_secs: 120,
            },
            webhook: WebhookConfig { token: None, timeout_secs: 10 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("courier.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(dispatch) = patch.dispatch {
            if let Some(max_retries) = dispatch.max_retries {
                self.dispatch.max_retries = max_retries;
            }
            if let Some(retry_base_delay_ms) = dispatch.retry_base_delay_ms {
                self.dispatch.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(retry_max_delay_ms) = dispatch.retry_max_delay_ms {
                self.dispatch.retry_max_delay_ms = retry_max_delay_ms;
            }
            if let Some(attempt_timeout_ms) = dispatch.attempt_timeout_ms {
                self.dispatch.attempt_timeout_ms = attempt_timeout_ms;
            }
        }

        if let Some(idempotency) = patch.idempotency {
            if let Some(ttl_secs) = idempotency.ttl_secs {
                self.idempotency.ttl_secs = ttl_secs;
            }
            if let Some(wait_timeout_ms) = idempotency.wait_timeout_ms {
                self.idempotency.wait_timeout_ms = wait_timeout_ms;
            }
            if let Some(poll_interval_ms) = idempotency.poll_interval_ms {
                self.idempotency.poll_interval_ms = poll_interval_ms;
            }
        }

        if let Some(sweeper) = patch.sweeper {
            if let Some(enabled) = sweeper.enabled {
                self.sweeper.enabled = enabled;
            }
            if let Some(interval_secs) = sweeper.interval_secs {
                self.sweeper.interval_secs = interval_secs;
            }
            if let Some(batch_size) = sweeper.batch_size {
                self.sweeper.batch_size = batch_size;
            }
            if let Some(max_batches) = sweeper.max_batches {
                self.sweeper.max_batches = max_batches;
            }
            if let Some(lease_secs) = sweeper.lease_secs {
                self.sweeper.lease_secs = lease_secs;
            }
        }

        if let Some(webhook) = patch.webhook {
            if let Some(token) = webhook.token {
                self.webhook.token = Some(secret_value(token));
            }
            if let Some(timeout_secs) = webhook.timeout_secs {
                self.webhook.timeout_secs = timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("COURIER_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("COURIER_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("COURIER_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("COURIER_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("COURIER_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("COURIER_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("COURIER_SERVER_PORT") {
            self.server.port = parse_u16("COURIER_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("COURIER_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("COURIER_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("COURIER_DISPATCH_MAX_RETRIES") {
            self.dispatch.max_retries = parse_u32("COURIER_DISPATCH_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("COURIER_DISPATCH_RETRY_BASE_DELAY_MS") {
            self.dispatch.retry_base_delay_ms =
                parse_u64("COURIER_DISPATCH_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("COURIER_DISPATCH_RETRY_MAX_DELAY_MS") {
            self.dispatch.retry_max_delay_ms =
                parse_u64("COURIER_DISPATCH_RETRY_MAX_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("COURIER_DISPATCH_ATTEMPT_TIMEOUT_MS") {
            self.dispatch.attempt_timeout_ms =
                parse_u64("COURIER_DISPATCH_ATTEMPT_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("COURIER_IDEMPOTENCY_TTL_SECS") {
            self.idempotency.ttl_secs = parse_u64("COURIER_IDEMPOTENCY_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("COURIER_IDEMPOTENCY_WAIT_TIMEOUT_MS") {
            self.idempotency.wait_timeout_ms =
                parse_u64("COURIER_IDEMPOTENCY_WAIT_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("COURIER_IDEMPOTENCY_POLL_INTERVAL_MS") {
            self.idempotency.poll_interval_ms =
                parse_u64("COURIER_IDEMPOTENCY_POLL_INTERVAL_MS", &value)?;
        }

        if let Some(value) = read_env("COURIER_SWEEPER_ENABLED") {
            self.sweeper.enabled = parse_bool("COURIER_SWEEPER_ENABLED", &value)?;
        }
        if let Some(value) = read_env("COURIER_SWEEPER_INTERVAL_SECS") {
            self.sweeper.interval_secs = parse_u64("COURIER_SWEEPER_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("COURIER_SWEEPER_BATCH_SIZE") {
            self.sweeper.batch_size = parse_u32("COURIER_SWEEPER_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("COURIER_SWEEPER_MAX_BATCHES") {
            self.sweeper.max_batches = parse_u32("COURIER_SWEEPER_MAX_BATCHES", &value)?;
        }
        if let Some(value) = read_env("COURIER_SWEEPER_LEASE_SECS") {
            self.sweeper.lease_secs = parse_u64("COURIER_SWEEPER_LEASE_SECS", &value)?;
        }

        if let Some(value) = read_env("COURIER_WEBHOOK_TOKEN") {
            self.webhook.token = Some(secret_value(value));
        }
        if let Some(value) = read_env("COURIER_WEBHOOK_TIMEOUT_SECS") {
            self.webhook.timeout_secs = parse_u64("COURIER_WEBHOOK_TIMEOUT_SECS", &value)?;
        }

        let log_level = read_env("COURIER_LOGGING_LEVEL").or_else(|| read_env("COURIER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("COURIER_LOGGING_FORMAT").or_else(|| read_env("COURIER_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(enabled) = overrides.sweeper_enabled {
            self.sweeper.enabled = enabled;
        }
        if let Some(token) = overrides.webhook_token {
            self.webhook.token = Some(secret_value(token));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_dispatch(&self.dispatch)?;
        validate_idempotency(&self.idempotency)?;
        validate_sweeper(&self.sweeper)?;
        validate_webhook(&self.webhook)?;
        validate_logging(&self.logging)?;
        validate_timeouts(&self.dispatch, &self.webhook)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("courier.toml"), PathBuf::from("config/courier.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_dispatch(dispatch: &DispatchConfig) -> Result<(), ConfigError> {
    if dispatch.max_retries > 10 {
        return Err(ConfigError::Validation(
            "dispatch.max_retries must be in range 0..=10".to_string(),
        ));
    }

    if dispatch.retry_max_delay_ms < dispatch.retry_base_delay_ms {
        return Err(ConfigError::Validation(
            "dispatch.retry_max_delay_ms must be >= dispatch.retry_base_delay_ms".to_string(),
        ));
    }

    if dispatch.attempt_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "dispatch.attempt_timeout_ms must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_idempotency(idempotency: &IdempotencyConfig) -> Result<(), ConfigError> {
    if idempotency.ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "idempotency.ttl_secs must be greater than zero".to_string(),
        ));
    }

    if idempotency.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "idempotency.poll_interval_ms must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_sweeper(sweeper: &SweeperConfig) -> Result<(), ConfigError> {
    if sweeper.interval_secs == 0 {
        return Err(ConfigError::Validation(
            "sweeper.interval_secs must be greater than zero".to_string(),
        ));
    }

    if sweeper.batch_size == 0 || sweeper.max_batches == 0 {
        return Err(ConfigError::Validation(
            "sweeper.batch_size and sweeper.max_batches must be greater than zero".to_string(),
        ));
    }

    if sweeper.lease_secs < sweeper.interval_secs {
        return Err(ConfigError::Validation(format!(
            "sweeper.lease_secs ({}) must be >= sweeper.interval_secs ({}) or leadership will flap",
            sweeper.lease_secs, sweeper.interval_secs
        )));
    }

    Ok(())
}

fn validate_webhook(webhook: &WebhookConfig) -> Result<(), ConfigError> {
    if webhook.timeout_secs == 0 || webhook.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "webhook.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    let blank_token =
        webhook.token.as_ref().is_some_and(|token| token.expose_secret().trim().is_empty());
    if blank_token {
        return Err(ConfigError::Validation(
            "webhook.token must not be blank when set; remove it to send unauthenticated requests"
                .to_string(),
        ));
    }

    Ok(())
}

/// The webhook client must not give up before the dispatcher's attempt
/// deadline, otherwise the attempt timeout is never the one that fires.
fn validate_timeouts(
    dispatch: &DispatchConfig,
    webhook: &WebhookConfig,
) -> Result<(), ConfigError> {
    let webhook_timeout_ms = webhook.timeout_secs.saturating_mul(1_000);
    if webhook_timeout_ms < dispatch.attempt_timeout_ms {
        return Err(ConfigError::Validation(format!(
            "webhook.timeout_secs ({}s) must be at least dispatch.attempt_timeout_ms ({}ms); \
             raise webhook.timeout_secs or lower dispatch.attempt_timeout_ms",
            webhook.timeout_secs, dispatch.attempt_timeout_ms
        )));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    dispatch: Option<DispatchPatch>,
    idempotency: Option<IdempotencyPatch>,
    sweeper: Option<SweeperPatch>,
    webhook: Option<WebhookPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DispatchPatch {
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    attempt_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct IdempotencyPatch {
    ttl_secs: Option<u64>,
    wait_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SweeperPatch {
    enabled: Option<bool>,
    interval_secs: Option<u64>,
    batch_size: Option<u32>,
    max_batches: Option<u32>,
    lease_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPatch {
    token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

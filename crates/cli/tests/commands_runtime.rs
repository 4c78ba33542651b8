use std::env;
use std::sync::{Mutex, OnceLock};

use courier_cli::commands::{config, doctor, migrate, seed, sweep};
use serde_json::Value;

const MEMORY_DB: &[(&str, &str)] =
    &[("COURIER_DATABASE_URL", "sqlite::memory:"), ("COURIER_DATABASE_MAX_CONNECTIONS", "1")];

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(MEMORY_DB, || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_unsupported_database_url() {
    with_env(&[("COURIER_DATABASE_URL", "postgres://localhost/courier")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn seed_returns_demo_tenant_summary() {
    with_env(MEMORY_DB, || {
        let result = seed::run();
        assert_eq!(result.exit_code, 0, "expected deterministic seed success");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "seed");
        assert_eq!(payload["status"], "ok");

        let message = payload["message"].as_str().unwrap_or("");
        assert!(message.contains(
            "  - t1: ck_demo_t1 (Every category routed to the sandbox provider)"
        ));
        assert!(message.contains(
            "  - t2: ck_demo_t2 (Sandbox CRM that always fails transiently; no other categories)"
        ));
    });
}

#[test]
fn seed_is_idempotent_across_runs() {
    with_env(MEMORY_DB, || {
        let first = seed::run();
        assert_eq!(first.exit_code, 0, "expected first seed invocation success");
        let first_payload = parse_payload(&first.output);

        let second = seed::run();
        assert_eq!(second.exit_code, 0, "expected second seed invocation success");
        let second_payload = parse_payload(&second.output);

        assert_eq!(first_payload["message"], second_payload["message"]);
    });
}

#[test]
fn sweep_reports_leader_cycle_on_empty_store() {
    with_env(MEMORY_DB, || {
        let result = sweep::run();
        assert_eq!(result.exit_code, 0, "expected successful sweep");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "sweep");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["details"]["leader"], true);
        assert_eq!(payload["details"]["deleted"], 0);
        assert_eq!(payload["details"]["capped"], false);
    });
}

#[test]
fn config_attributes_env_sources_and_redacts_webhook_token() {
    with_env(
        &[
            ("COURIER_DATABASE_URL", "sqlite::memory:"),
            ("COURIER_WEBHOOK_TOKEN", "whk_supersecret"),
            ("COURIER_LOG_LEVEL", "debug"),
        ],
        || {
            let output = config::run();
            assert!(output.contains(
                "- database.url = sqlite::memory: (source: env (COURIER_DATABASE_URL))"
            ));
            assert!(output
                .contains("- webhook.token = whk_*** (source: env (COURIER_WEBHOOK_TOKEN))"));
            assert!(output.contains("- logging.level = debug (source: env (COURIER_LOG_LEVEL))"));
            assert!(!output.contains("supersecret"));
        },
    );
}

#[test]
fn doctor_flags_unmigrated_memory_database() {
    with_env(
        &[("COURIER_DATABASE_URL", "sqlite::memory:"), ("COURIER_DATABASE_MAX_CONNECTIONS", "1")],
        || {
            let result = doctor::run(true);
            let report: Value = serde_json::from_str(&result.output).expect("doctor json");

            // A fresh in-memory database has no schema, so only the backlog check fails.
            let checks = report["checks"].as_array().expect("checks array");
            let status_of = |name: &str| {
                checks
                    .iter()
                    .find(|check| check["name"] == name)
                    .map(|check| check["status"].clone())
                    .unwrap_or(Value::Null)
            };
            assert_eq!(status_of("config_validation"), "pass");
            assert_eq!(status_of("provider_registry"), "pass");
            assert_eq!(status_of("database_connectivity"), "pass");
            assert_eq!(status_of("idempotency_backlog"), "fail");
            assert_eq!(result.exit_code, 6);
        },
    );
}

#[test]
fn doctor_skips_downstream_checks_when_config_invalid() {
    with_env(&[("COURIER_DATABASE_URL", "mysql://nope")], || {
        let result = doctor::run(false);
        assert_eq!(result.exit_code, 6);
        assert!(result.output.starts_with("doctor: one or more readiness checks failed"));
        assert!(result.output.contains("- [fail] config_validation:"));
        assert!(result.output.contains("- [skip] database_connectivity:"));
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "COURIER_DATABASE_URL",
        "COURIER_DATABASE_MAX_CONNECTIONS",
        "COURIER_DATABASE_TIMEOUT_SECS",
        "COURIER_SERVER_BIND_ADDRESS",
        "COURIER_SERVER_PORT",
        "COURIER_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "COURIER_DISPATCH_MAX_RETRIES",
        "COURIER_DISPATCH_RETRY_BASE_DELAY_MS",
        "COURIER_DISPATCH_RETRY_MAX_DELAY_MS",
        "COURIER_DISPATCH_ATTEMPT_TIMEOUT_MS",
        "COURIER_IDEMPOTENCY_TTL_SECS",
        "COURIER_IDEMPOTENCY_WAIT_TIMEOUT_MS",
        "COURIER_IDEMPOTENCY_POLL_INTERVAL_MS",
        "COURIER_SWEEPER_ENABLED",
        "COURIER_SWEEPER_INTERVAL_SECS",
        "COURIER_SWEEPER_BATCH_SIZE",
        "COURIER_SWEEPER_MAX_BATCHES",
        "COURIER_SWEEPER_LEASE_SECS",
        "COURIER_WEBHOOK_TOKEN",
        "COURIER_WEBHOOK_TIMEOUT_SECS",
        "COURIER_LOGGING_LEVEL",
        "COURIER_LOGGING_FORMAT",
        "COURIER_LOG_LEVEL",
        "COURIER_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}

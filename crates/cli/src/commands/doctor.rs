use chrono::Utc;
use courier_core::config::{AppConfig, LoadOptions};
use courier_core::providers::{sandbox::register_sandbox, ProviderRegistry};
use courier_db::connect_with_settings;
use courier_db::repositories::{IdempotencyRepository, SqlIdempotencyRepository};
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 6 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\
                 \"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_provider_registry(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["provider_registry", "database_connectivity", "idempotency_backlog"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

/// Builds the in-process part of the registry. The webhook provider needs an
/// HTTP client and is only reported here.
fn check_provider_registry(config: &AppConfig) -> DoctorCheck {
    let mut registry = ProviderRegistry::new();
    if let Err(error) = register_sandbox(&mut registry) {
        return DoctorCheck {
            name: "provider_registry",
            status: CheckStatus::Fail,
            details: format!("sandbox registration failed: {error}"),
        };
    }

    let status = registry.status();
    let categories =
        status.categories.keys().map(|category| category.to_string()).collect::<Vec<_>>();
    let webhook = if config.webhook.token.is_some() {
        "webhook default token configured"
    } else {
        "webhook default token unset (tenants must supply their own)"
    };

    DoctorCheck {
        name: "provider_registry",
        status: CheckStatus::Pass,
        details: format!(
            "{} sandbox providers across [{}]; {webhook}",
            status.total_providers,
            categories.join(", ")
        ),
    }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    DoctorCheck {
                        name: "idempotency_backlog",
                        status: CheckStatus::Skipped,
                        details: "skipped because the database is unreachable".to_string(),
                    },
                ];
            }
        };

        let connectivity = DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        };

        let counted = SqlIdempotencyRepository::new(pool.clone()).count_expired(Utc::now()).await;
        let backlog = match counted {
            Ok(expired) => DoctorCheck {
                name: "idempotency_backlog",
                status: CheckStatus::Pass,
                details: format!("{expired} expired idempotency records awaiting sweep"),
            },
            Err(error) => DoctorCheck {
                name: "idempotency_backlog",
                status: CheckStatus::Fail,
                details: format!("schema check failed ({error}); run `courier migrate`"),
            },
        };

        pool.close().await;
        vec![connectivity, backlog]
    })
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

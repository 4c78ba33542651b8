use crate::commands::{with_migrated_pool, CommandResult};
use courier_db::{DemoSeedDataset, SeededTenant};

pub fn run() -> CommandResult {
    let result = with_migrated_pool("seed", |_, pool| async move {
        let seed_result = DemoSeedDataset::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;

        let verification = DemoSeedDataset::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        if !verification.all_present {
            let message = verification_failure_message(&verification.checks);
            return Err(("seed_verification", message, 6u8));
        }

        Ok(seed_result.tenants_seeded)
    });

    match result {
        Ok(tenants) => CommandResult::success("seed", render_tenants(&tenants)),
        Err(failure) => failure,
    }
}

fn render_tenants(tenants: &[SeededTenant]) -> String {
    let lines: Vec<String> = tenants
        .iter()
        .map(|tenant| {
            format!("  - {}: {} ({})", tenant.tenant_id, tenant.api_key, tenant.description)
        })
        .collect();
    format!("demo tenants loaded:\n{}", lines.join("\n"))
}

fn verification_failure_message(checks: &[(&'static str, bool)]) -> String {
    let failed_checks =
        checks.iter().filter_map(|(check, passed)| (!passed).then_some(*check)).collect::<Vec<_>>();

    if failed_checks.is_empty() {
        "Some seed data failed to load".to_string()
    } else {
        format!("Seed verification failed for checks: {}", failed_checks.join(", "))
    }
}

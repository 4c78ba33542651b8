use std::sync::Arc;

use chrono::Utc;
use courier_db::repositories::{LeaseRepository, SqlIdempotencyRepository, SqlLeaseRepository};
use courier_dispatch::{ExpirySweeper, SweeperSettings, EXPIRY_LEASE_NAME};

use crate::commands::{with_migrated_pool, CommandResult};

/// Runs a single sweep cycle in the foreground. The lease is released
/// afterwards so a running server's sweeper can take it on its next tick.
pub fn run() -> CommandResult {
    let result = with_migrated_pool("sweep", |config, pool| async move {
        let leases = Arc::new(SqlLeaseRepository::new(pool.clone()));
        let sweeper = ExpirySweeper::new(
            Arc::new(SqlIdempotencyRepository::new(pool)),
            leases.clone(),
            SweeperSettings::from(&config.sweeper),
        )
        .with_holder(format!("courier-cli-{}", std::process::id()));

        let report = sweeper
            .run_once(Utc::now())
            .await
            .map_err(|error| ("sweep_execution", error.to_string(), 5u8))?;

        if report.leader {
            leases
                .release(EXPIRY_LEASE_NAME, sweeper.holder())
                .await
                .map_err(|error| ("sweep_execution", error.to_string(), 5u8))?;
        }

        Ok(report)
    });

    match result {
        Ok(report) => {
            let message = if !report.leader {
                "sweep skipped: another node holds the sweeper lease".to_string()
            } else if report.capped {
                format!(
                    "deleted {} expired idempotency records in {} batches (cycle cap reached)",
                    report.deleted, report.batches
                )
            } else {
                format!(
                    "deleted {} expired idempotency records in {} batches",
                    report.deleted, report.batches
                )
            };
            let details = serde_json::to_value(&report).ok();
            CommandResult::success_with_details("sweep", message, details)
        }
        Err(failure) => failure,
    }
}

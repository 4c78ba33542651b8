//! Leader-elected reclamation of expired idempotency records.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, error, info};
use uuid::Uuid;

use courier_core::config::SweeperConfig;
use courier_db::repositories::{IdempotencyRepository, LeaseRepository, RepositoryError};

pub const EXPIRY_LEASE_NAME: &str = "idempotency-expiry";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweeperSettings {
    pub interval: Duration,
    pub batch_size: u32,
    pub max_batches: u32,
    pub lease_ttl: chrono::Duration,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 500,
            max_batches: 10,
            lease_ttl: chrono::Duration::seconds(120),
        }
    }
}

impl From<&SweeperConfig> for SweeperSettings {
    fn from(config: &SweeperConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            batch_size: config.batch_size,
            max_batches: config.max_batches,
            lease_ttl: chrono::Duration::seconds(
                i64::try_from(config.lease_secs).unwrap_or(i64::MAX),
            ),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub leader: bool,
    pub batches: u32,
    pub deleted: u64,
    /// Set when the per-cycle batch cap stopped the sweep early.
    pub capped: bool,
}

/// Cloneable stop signal for a running sweeper loop.
#[derive(Clone, Default)]
pub struct SweeperShutdown {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl SweeperShutdown {
    pub fn request(&self) {
        self.requested.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }
}

pub struct ExpirySweeper {
    idempotency: Arc<dyn IdempotencyRepository>,
    leases: Arc<dyn LeaseRepository>,
    holder: String,
    settings: SweeperSettings,
    shutdown: SweeperShutdown,
}

impl ExpirySweeper {
    pub fn new(
        idempotency: Arc<dyn IdempotencyRepository>,
        leases: Arc<dyn LeaseRepository>,
        settings: SweeperSettings,
    ) -> Self {
        Self {
            idempotency,
            leases,
            holder: format!("sweeper-{}", Uuid::new_v4()),
            settings,
            shutdown: SweeperShutdown::default(),
        }
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn shutdown_handle(&self) -> SweeperShutdown {
        self.shutdown.clone()
    }

    /// One sweep cycle: take or renew the lease, then delete expired records
    /// in bounded batches. Followers return an empty, non-leader report.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport, RepositoryError> {
        let leader = self
            .leases
            .try_acquire(EXPIRY_LEASE_NAME, &self.holder, self.settings.lease_ttl, now)
            .await?;
        if !leader {
            debug!(
                event_name = "sweeper.cycle.skipped",
                holder = %self.holder,
                "another node holds the sweeper lease"
            );
            return Ok(SweepReport::default());
        }

        let mut report = SweepReport { leader: true, ..SweepReport::default() };
        while report.batches < self.settings.max_batches {
            let deleted =
                self.idempotency.delete_expired_batch(now, self.settings.batch_size).await?;
            report.batches += 1;
            report.deleted += deleted;
            if deleted < u64::from(self.settings.batch_size) {
                return Ok(report);
            }
        }

        report.capped = true;
        Ok(report)
    }

    /// Runs cycles on the configured interval until shutdown is requested,
    /// then releases the lease.
    pub async fn run(&self) {
        info!(
            event_name = "sweeper.start",
            holder = %self.holder,
            interval_secs = self.settings.interval.as_secs(),
            batch_size = self.settings.batch_size,
            "expiry sweeper started"
        );

        let mut ticker = interval(self.settings.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.shutdown.is_requested() {
                        break;
                    }
                    self.tick().await;
                }
                _ = self.shutdown.notify.notified() => {}
            }
            if self.shutdown.is_requested() {
                break;
            }
        }

        match self.leases.release(EXPIRY_LEASE_NAME, &self.holder).await {
            Ok(released) => info!(
                event_name = "sweeper.stop",
                holder = %self.holder,
                released,
                "expiry sweeper stopped"
            ),
            Err(release_error) => error!(
                event_name = "sweeper.stop",
                holder = %self.holder,
                error = %release_error,
                "expiry sweeper stopped without releasing its lease"
            ),
        }
    }

    async fn tick(&self) {
        match self.run_once(Utc::now()).await {
            Ok(report) if report.leader => info!(
                event_name = "sweeper.cycle.completed",
                holder = %self.holder,
                deleted = report.deleted,
                batches = report.batches,
                capped = report.capped,
                "expired idempotency records swept"
            ),
            Ok(_) => {}
            Err(sweep_error) => error!(
                event_name = "sweeper.cycle.failed",
                holder = %self.holder,
                error = %sweep_error,
                "sweep cycle failed; retrying next tick"
            ),
        }
    }
}

//! Idempotency guard.
//!
//! Deduplicates mutating requests per `(tenant, key)`. The storage uniqueness
//! constraint is the only arbiter between concurrent callers; no lock is held
//! while the reserved action runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_core::config::IdempotencyConfig;
use courier_core::domain::idempotency::{
    hash_request_body, CachedResponse, IdempotencyKey, IdempotencyRecord, IdempotencyRecordId,
};
use courier_core::domain::tenant::TenantId;
use courier_db::repositories::{IdempotencyRepository, RepositoryError, ReserveOutcome};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardSettings {
    pub ttl: chrono::Duration,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::seconds(86_400),
            wait_timeout: Duration::from_millis(5_000),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl From<&IdempotencyConfig> for GuardSettings {
    fn from(config: &IdempotencyConfig) -> Self {
        Self {
            ttl: chrono::Duration::seconds(i64::try_from(config.ttl_secs).unwrap_or(i64::MAX)),
            wait_timeout: Duration::from_millis(config.wait_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

/// Request identity the guard compares against stored reservations.
#[derive(Clone, Copy, Debug)]
pub struct GuardRequest<'a> {
    pub tenant_id: &'a TenantId,
    pub key: &'a IdempotencyKey,
    pub method: &'a str,
    pub path: &'a str,
    pub body: &'a Value,
}

/// A placeholder this caller owns until it is finalized.
#[derive(Clone, Debug, PartialEq)]
pub struct Reservation {
    pub record_id: IdempotencyRecordId,
    pub tenant_id: TenantId,
    pub key: IdempotencyKey,
    pub expires_at: chrono::DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictReason {
    BodyMismatch,
    RequestMismatch,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BodyMismatch => "body_mismatch",
            Self::RequestMismatch => "request_mismatch",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum GuardDecision {
    New(Reservation),
    Duplicate(CachedResponse),
    Conflict(ConflictReason),
    /// The key is held by a request that did not finish within the wait window.
    InProgress { retry_after_ms: u64 },
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("idempotency key `{key}` for tenant `{tenant}` is already finalized")]
    AlreadyFinalized { tenant: TenantId, key: IdempotencyKey },
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    repo: Arc<dyn IdempotencyRepository>,
    settings: GuardSettings,
}

impl IdempotencyGuard {
    pub fn new(repo: Arc<dyn IdempotencyRepository>, settings: GuardSettings) -> Self {
        Self { repo, settings }
    }

    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }

    pub async fn check_or_reserve(
        &self,
        request: GuardRequest<'_>,
    ) -> Result<GuardDecision, GuardError> {
        let body_hash = hash_request_body(request.body);
        let record_id = IdempotencyRecordId(Uuid::new_v4().to_string());
        let deadline = Instant::now() + self.settings.wait_timeout;

        loop {
            let now = Utc::now();
            let candidate = IdempotencyRecord {
                id: record_id.clone(),
                tenant_id: request.tenant_id.clone(),
                idempotency_key: request.key.clone(),
                request_method: request.method.to_ascii_uppercase(),
                request_path: request.path.to_string(),
                request_body_hash: body_hash.clone(),
                response: None,
                created_at: now,
                updated_at: now,
                expires_at: now + self.settings.ttl,
            };

            let existing = match self.repo.try_reserve(&candidate).await? {
                ReserveOutcome::Reserved => {
                    debug!(
                        event_name = "guard.key.reserved",
                        tenant_id = %request.tenant_id.0,
                        idempotency_key = %request.key,
                        "idempotency key reserved"
                    );
                    return Ok(GuardDecision::New(reservation_for(&candidate)));
                }
                ReserveOutcome::Existing(existing) => existing,
            };

            if existing.is_expired(now) {
                if self.repo.reclaim_expired(&candidate, now).await? {
                    info!(
                        event_name = "guard.key.reclaimed",
                        tenant_id = %request.tenant_id.0,
                        idempotency_key = %request.key,
                        expired_at = %existing.expires_at,
                        "expired idempotency key reclaimed"
                    );
                    return Ok(GuardDecision::New(reservation_for(&candidate)));
                }
                // Another racer reclaimed it or the sweeper removed it; re-read.
                if Instant::now() >= deadline {
                    return Ok(self.in_progress());
                }
                continue;
            }

            if existing.request_body_hash != body_hash {
                return Ok(GuardDecision::Conflict(ConflictReason::BodyMismatch));
            }
            if !existing.matches_request(request.method, request.path, &body_hash) {
                return Ok(GuardDecision::Conflict(ConflictReason::RequestMismatch));
            }

            if let Some(response) = existing.response {
                return Ok(GuardDecision::Duplicate(response));
            }

            if Instant::now() >= deadline {
                warn!(
                    event_name = "guard.key.in_progress",
                    tenant_id = %request.tenant_id.0,
                    idempotency_key = %request.key,
                    wait_timeout_ms = self.settings.wait_timeout.as_millis() as u64,
                    "idempotency key still in flight after bounded wait"
                );
                return Ok(self.in_progress());
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Stores the terminal response for a reservation. A reservation can be
    /// finalized exactly once.
    pub async fn finalize(
        &self,
        reservation: &Reservation,
        response: &CachedResponse,
    ) -> Result<(), GuardError> {
        if self.repo.finalize(&reservation.record_id, response, Utc::now()).await? {
            return Ok(());
        }

        Err(GuardError::AlreadyFinalized {
            tenant: reservation.tenant_id.clone(),
            key: reservation.key.clone(),
        })
    }

    /// Live record for `(tenant, key)`; expired records are treated as absent.
    pub async fn lookup(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, GuardError> {
        let now = Utc::now();
        Ok(self.repo.find(tenant_id, key).await?.filter(|record| !record.is_expired(now)))
    }

    fn in_progress(&self) -> GuardDecision {
        let retry_after_ms =
            u64::try_from(self.settings.poll_interval.as_millis()).unwrap_or(u64::MAX);
        GuardDecision::InProgress { retry_after_ms: retry_after_ms.max(1) }
    }
}

fn reservation_for(record: &IdempotencyRecord) -> Reservation {
    Reservation {
        record_id: record.id.clone(),
        tenant_id: record.tenant_id.clone(),
        key: record.idempotency_key.clone(),
        expires_at: record.expires_at,
    }
}

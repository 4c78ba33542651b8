use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use courier_core::domain::action::{ActionLog, ActionLogId};
use courier_core::domain::idempotency::{
    CachedResponse, IdempotencyKey, IdempotencyRecord, IdempotencyRecordId,
};
use courier_core::domain::tenant::{Tenant, TenantId};

pub mod action_log;
pub mod idempotency;
pub mod lease;
pub mod memory;
pub mod tenant;

pub use action_log::SqlActionLogRepository;
pub use idempotency::SqlIdempotencyRepository;
pub use lease::SqlLeaseRepository;
pub use memory::{
    InMemoryActionLogRepository, InMemoryIdempotencyRepository, InMemoryLeaseRepository,
    InMemoryTenantRepository,
};
pub use tenant::SqlTenantRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("contention: {0}")]
    Contention(String),
}

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError>;
    async fn find_by_api_key_hash(
        &self,
        api_key_hash: &str,
    ) -> Result<Option<Tenant>, RepositoryError>;
    async fn save(&self, tenant: Tenant) -> Result<(), RepositoryError>;
}

/// Result of the atomic placeholder insert for an idempotency key.
#[derive(Clone, Debug, PartialEq)]
pub enum ReserveOutcome {
    Reserved,
    /// Another request already holds the key; the current row is returned.
    Existing(IdempotencyRecord),
}

#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Inserts `record` unless `(tenant_id, idempotency_key)` already exists.
    async fn try_reserve(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ReserveOutcome, RepositoryError>;

    /// Overwrites the stored row with `record` only if the stored row expired
    /// at or before `now`. Exactly one concurrent caller observes `true`.
    async fn reclaim_expired(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn find(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, RepositoryError>;

    /// Writes the cached response for the reservation `id` if it has none yet.
    async fn finalize(
        &self,
        id: &IdempotencyRecordId,
        response: &CachedResponse,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn delete_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, RepositoryError>;

    async fn count_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait ActionLogRepository: Send + Sync {
    async fn insert(&self, log: &ActionLog) -> Result<(), RepositoryError>;

    /// Persists `log` over a non-terminal row. Returns `false` when the stored
    /// row is missing or already terminal.
    async fn update(&self, log: &ActionLog) -> Result<bool, RepositoryError>;

    async fn find_by_id(&self, id: &ActionLogId) -> Result<Option<ActionLog>, RepositoryError>;

    /// Most recent first.
    async fn list_recent(
        &self,
        tenant_id: &TenantId,
        limit: u32,
    ) -> Result<Vec<ActionLog>, RepositoryError>;

    async fn list_for_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Vec<ActionLog>, RepositoryError>;

    async fn stats(&self, tenant_id: Option<&TenantId>) -> Result<ActionStats, RepositoryError>;
}

#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Takes or renews `name` for `holder` until `now + ttl`. Fails while
    /// another holder's lease is unexpired.
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn release(&self, name: &str, holder: &str) -> Result<bool, RepositoryError>;

    async fn current_holder(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, RepositoryError>;
}

/// Aggregate view over `action_logs` for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ActionStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_action_type: BTreeMap<String, u64>,
    pub by_provider: BTreeMap<String, u64>,
    pub average_latency_ms: Option<f64>,
}

impl ActionStats {
    pub fn from_logs<'a>(logs: impl IntoIterator<Item = &'a ActionLog>) -> Self {
        let mut stats = Self::default();
        let mut latency_total = 0_u64;
        let mut latency_count = 0_u64;

        for log in logs {
            stats.total += 1;
            *stats.by_status.entry(log.status.as_str().to_string()).or_default() += 1;
            *stats.by_action_type.entry(log.action_type.as_str().to_string()).or_default() += 1;
            let provider = log
                .metadata
                .get("provider")
                .and_then(serde_json::Value::as_str)
                .unwrap_or(UNKNOWN_PROVIDER);
            *stats.by_provider.entry(provider.to_string()).or_default() += 1;
            if let Some(latency) = log.latency_ms {
                latency_total += latency;
                latency_count += 1;
            }
        }

        stats.average_latency_ms =
            (latency_count > 0).then(|| latency_total as f64 / latency_count as f64);
        stats
    }
}

pub(crate) const UNKNOWN_PROVIDER: &str = "unknown";

/// Fixed-width UTC encoding so that text comparison in SQL is chronological.
pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u64): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    column: &str,
    value: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

pub(crate) fn encode_json<T: Serialize>(
    column: &str,
    value: &T,
) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("could not encode `{column}`: {error}")))
}

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use courier_core::domain::action::{ActionLog, ActionLogId};
use courier_core::domain::idempotency::{
    CachedResponse, IdempotencyKey, IdempotencyRecord, IdempotencyRecordId,
};
use courier_core::domain::tenant::{Tenant, TenantId};

use super::{
    ActionLogRepository, ActionStats, IdempotencyRepository, LeaseRepository, RepositoryError,
    ReserveOutcome, TenantRepository,
};

#[derive(Default)]
pub struct InMemoryTenantRepository {
    tenants: RwLock<HashMap<String, Tenant>>,
}

#[async_trait::async_trait]
impl TenantRepository for InMemoryTenantRepository {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
        let tenants = self.tenants.read().await;
        Ok(tenants.get(&id.0).cloned())
    }

    async fn find_by_api_key_hash(
        &self,
        api_key_hash: &str,
    ) -> Result<Option<Tenant>, RepositoryError> {
        let tenants = self.tenants.read().await;
        Ok(tenants.values().find(|tenant| tenant.api_key_hash == api_key_hash).cloned())
    }

    async fn save(&self, tenant: Tenant) -> Result<(), RepositoryError> {
        let mut tenants = self.tenants.write().await;
        tenants.insert(tenant.id.0.clone(), tenant);
        Ok(())
    }
}

type RecordKey = (String, String);

#[derive(Default)]
pub struct InMemoryIdempotencyRepository {
    records: RwLock<HashMap<RecordKey, IdempotencyRecord>>,
}

fn record_key(tenant_id: &TenantId, key: &IdempotencyKey) -> RecordKey {
    (tenant_id.0.clone(), key.0.clone())
}

#[async_trait::async_trait]
impl IdempotencyRepository for InMemoryIdempotencyRepository {
    async fn try_reserve(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ReserveOutcome, RepositoryError> {
        let mut records = self.records.write().await;
        let key = record_key(&record.tenant_id, &record.idempotency_key);
        if let Some(existing) = records.get(&key) {
            return Ok(ReserveOutcome::Existing(existing.clone()));
        }

        let mut placeholder = record.clone();
        placeholder.response = None;
        records.insert(key, placeholder);
        Ok(ReserveOutcome::Reserved)
    }

    async fn reclaim_expired(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().await;
        let key = record_key(&record.tenant_id, &record.idempotency_key);
        match records.get_mut(&key) {
            Some(existing) if existing.expires_at <= now => {
                *existing = record.clone();
                existing.response = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&record_key(tenant_id, key)).cloned())
    }

    async fn finalize(
        &self,
        id: &IdempotencyRecordId,
        response: &CachedResponse,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().await;
        match records.values_mut().find(|record| &record.id == id) {
            Some(record) if record.response.is_none() => {
                record.response = Some(response.clone());
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, RepositoryError> {
        let mut records = self.records.write().await;
        let mut expired: Vec<(DateTime<Utc>, RecordKey)> = records
            .iter()
            .filter(|(_, record)| record.expires_at <= now)
            .map(|(key, record)| (record.expires_at, key.clone()))
            .collect();
        expired.sort();

        let mut deleted = 0;
        for (_, key) in expired.into_iter().take(limit as usize) {
            records.remove(&key);
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn count_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.values().filter(|record| record.expires_at <= now).count() as u64)
    }
}

#[derive(Default)]
pub struct InMemoryActionLogRepository {
    logs: RwLock<Vec<ActionLog>>,
}

#[async_trait::async_trait]
impl ActionLogRepository for InMemoryActionLogRepository {
    async fn insert(&self, log: &ActionLog) -> Result<(), RepositoryError> {
        let mut logs = self.logs.write().await;
        if logs.iter().any(|existing| existing.id == log.id) {
            return Err(RepositoryError::Contention(format!(
                "action log `{}` already exists",
                log.id
            )));
        }
        logs.push(log.clone());
        Ok(())
    }

    async fn update(&self, log: &ActionLog) -> Result<bool, RepositoryError> {
        let mut logs = self.logs.write().await;
        match logs.iter_mut().find(|existing| existing.id == log.id) {
            Some(existing) if !existing.status.is_terminal() => {
                existing.status = log.status;
                existing.attempt_count = log.attempt_count;
                existing.latency_ms = log.latency_ms;
                existing.metadata = log.metadata.clone();
                existing.updated_at = log.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_by_id(&self, id: &ActionLogId) -> Result<Option<ActionLog>, RepositoryError> {
        let logs = self.logs.read().await;
        Ok(logs.iter().find(|log| &log.id == id).cloned())
    }

    async fn list_recent(
        &self,
        tenant_id: &TenantId,
        limit: u32,
    ) -> Result<Vec<ActionLog>, RepositoryError> {
        let logs = self.logs.read().await;
        let mut matching: Vec<ActionLog> =
            logs.iter().filter(|log| &log.tenant_id == tenant_id).cloned().collect();
        matching.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then_with(|| right.id.0.cmp(&left.id.0))
        });
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn list_for_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Vec<ActionLog>, RepositoryError> {
        let logs = self.logs.read().await;
        Ok(logs
            .iter()
            .filter(|log| &log.tenant_id == tenant_id && log.idempotency_key.as_ref() == Some(key))
            .cloned()
            .collect())
    }

    async fn stats(&self, tenant_id: Option<&TenantId>) -> Result<ActionStats, RepositoryError> {
        let logs = self.logs.read().await;
        Ok(ActionStats::from_logs(
            logs.iter().filter(|log| tenant_id.map_or(true, |tenant| &log.tenant_id == tenant)),
        ))
    }
}

#[derive(Clone, Debug)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryLeaseRepository {
    leases: RwLock<HashMap<String, Lease>>,
}

#[async_trait::async_trait]
impl LeaseRepository for InMemoryLeaseRepository {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut leases = self.leases.write().await;
        let available = leases
            .get(name)
            .map_or(true, |lease| lease.holder == holder || lease.expires_at <= now);
        if available {
            leases.insert(
                name.to_string(),
                Lease { holder: holder.to_string(), expires_at: now + ttl },
            );
        }
        Ok(available)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool, RepositoryError> {
        let mut leases = self.leases.write().await;
        if leases.get(name).is_some_and(|lease| lease.holder == holder) {
            leases.remove(name);
            return Ok(true);
        }
        Ok(false)
    }

    async fn current_holder(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, RepositoryError> {
        let leases = self.leases.read().await;
        Ok(leases
            .get(name)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.holder.clone()))
    }
}

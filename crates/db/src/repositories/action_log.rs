use std::collections::BTreeMap;

use sqlx::{sqlite::SqliteRow, Row};

use courier_core::domain::action::{
    ActionLog, ActionLogId, ActionMetadata, ActionStatus, ActionType,
};
use courier_core::domain::idempotency::IdempotencyKey;
use courier_core::domain::tenant::TenantId;

use super::{
    encode_json, encode_timestamp, parse_json, parse_timestamp, parse_u32, parse_u64,
    ActionLogRepository, ActionStats, RepositoryError, UNKNOWN_PROVIDER,
};
use crate::DbPool;

const LOG_COLUMNS: &str = "id,
    tenant_id,
    action_type,
    status,
    attempt_count,
    latency_ms,
    idempotency_key,
    action_metadata,
    created_at,
    updated_at";

pub struct SqlActionLogRepository {
    pool: DbPool,
}

impl SqlActionLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn grouped_counts(
        &self,
        group_expression: &str,
        tenant_id: Option<&TenantId>,
    ) -> Result<BTreeMap<String, u64>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {group_expression} AS bucket, COUNT(*) AS count
             FROM action_logs
             WHERE (?1 IS NULL OR tenant_id = ?1)
             GROUP BY bucket"
        ))
        .bind(tenant_id.map(|tenant| tenant.0.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let bucket = row.try_get::<String, _>("bucket")?;
                let count = parse_u64("count", row.try_get("count")?)?;
                Ok((bucket, count))
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ActionLogRepository for SqlActionLogRepository {
    async fn insert(&self, log: &ActionLog) -> Result<(), RepositoryError> {
        let metadata = encode_json("action_metadata", &log.metadata)?;

        sqlx::query(
            "INSERT INTO action_logs (
                id,
                tenant_id,
                action_type,
                status,
                attempt_count,
                latency_ms,
                idempotency_key,
                action_metadata,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&log.id.0)
        .bind(&log.tenant_id.0)
        .bind(log.action_type.as_str())
        .bind(log.status.as_str())
        .bind(i64::from(log.attempt_count))
        .bind(encode_latency(log.latency_ms)?)
        .bind(log.idempotency_key.as_ref().map(|key| key.0.as_str()))
        .bind(metadata)
        .bind(encode_timestamp(log.created_at))
        .bind(encode_timestamp(log.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, log: &ActionLog) -> Result<bool, RepositoryError> {
        let metadata = encode_json("action_metadata", &log.metadata)?;

        let updated = sqlx::query(
            "UPDATE action_logs SET
                status = ?,
                attempt_count = ?,
                latency_ms = ?,
                action_metadata = ?,
                updated_at = ?
             WHERE id = ? AND status IN ('PENDING', 'RETRY')",
        )
        .bind(log.status.as_str())
        .bind(i64::from(log.attempt_count))
        .bind(encode_latency(log.latency_ms)?)
        .bind(metadata)
        .bind(encode_timestamp(log.updated_at))
        .bind(&log.id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn find_by_id(&self, id: &ActionLogId) -> Result<Option<ActionLog>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {LOG_COLUMNS} FROM action_logs WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(log_from_row).transpose()
    }

    async fn list_recent(
        &self,
        tenant_id: &TenantId,
        limit: u32,
    ) -> Result<Vec<ActionLog>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS}
             FROM action_logs
             WHERE tenant_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?"
        ))
        .bind(&tenant_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(log_from_row).collect()
    }

    async fn list_for_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Vec<ActionLog>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS}
             FROM action_logs
             WHERE tenant_id = ? AND idempotency_key = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&tenant_id.0)
        .bind(&key.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(log_from_row).collect()
    }

    async fn stats(&self, tenant_id: Option<&TenantId>) -> Result<ActionStats, RepositoryError> {
        let by_status = self.grouped_counts("status", tenant_id).await?;
        let by_action_type = self.grouped_counts("action_type", tenant_id).await?;
        let by_provider = self
            .grouped_counts(
                &format!(
                    "COALESCE(json_extract(action_metadata, '$.provider'), '{UNKNOWN_PROVIDER}')"
                ),
                tenant_id,
            )
            .await?;

        let average_latency_ms = sqlx::query(
            "SELECT AVG(latency_ms) AS average
             FROM action_logs
             WHERE latency_ms IS NOT NULL AND (?1 IS NULL OR tenant_id = ?1)",
        )
        .bind(tenant_id.map(|tenant| tenant.0.as_str()))
        .fetch_one(&self.pool)
        .await?
        .try_get::<Option<f64>, _>("average")?;

        Ok(ActionStats {
            total: by_status.values().sum(),
            by_status,
            by_action_type,
            by_provider,
            average_latency_ms,
        })
    }
}

fn encode_latency(latency_ms: Option<u64>) -> Result<Option<i64>, RepositoryError> {
    latency_ms
        .map(|value| {
            i64::try_from(value)
                .map_err(|_| RepositoryError::Decode(format!("latency_ms out of range: {value}")))
        })
        .transpose()
}

fn log_from_row(row: SqliteRow) -> Result<ActionLog, RepositoryError> {
    let action_type_raw = row.try_get::<String, _>("action_type")?;
    let action_type = ActionType::parse(&action_type_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown action type `{action_type_raw}`"))
    })?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = ActionStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown action status `{status_raw}`")))?;

    let metadata_raw = row.try_get::<String, _>("action_metadata")?;
    let metadata: ActionMetadata = parse_json("action_metadata", &metadata_raw)?;

    Ok(ActionLog {
        id: ActionLogId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        action_type,
        status,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        latency_ms: row
            .try_get::<Option<i64>, _>("latency_ms")?
            .map(|value| parse_u64("latency_ms", value))
            .transpose()?,
        idempotency_key: row.try_get::<Option<String>, _>("idempotency_key")?.map(IdempotencyKey),
        metadata,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

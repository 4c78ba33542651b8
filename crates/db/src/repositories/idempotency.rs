use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use courier_core::domain::idempotency::{
    CachedResponse, IdempotencyKey, IdempotencyRecord, IdempotencyRecordId,
};
use courier_core::domain::tenant::TenantId;

use super::{
    encode_json, encode_timestamp, parse_json, parse_timestamp, parse_u64, IdempotencyRepository,
    RepositoryError, ReserveOutcome,
};
use crate::DbPool;

const RECORD_COLUMNS: &str = "id,
    tenant_id,
    idempotency_key,
    request_method,
    request_path,
    request_body_hash,
    response_status_code,
    response_body,
    created_at,
    updated_at,
    expires_at";

/// Bounded so that a key deleted and re-taken between insert and re-read
/// surfaces as contention rather than spinning.
const RESERVE_ATTEMPTS: usize = 3;

pub struct SqlIdempotencyRepository {
    pool: DbPool,
}

impl SqlIdempotencyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl IdempotencyRepository for SqlIdempotencyRepository {
    async fn try_reserve(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ReserveOutcome, RepositoryError> {
        for _ in 0..RESERVE_ATTEMPTS {
            let inserted = sqlx::query(
                "INSERT INTO idempotency_keys (
                    id,
                    tenant_id,
                    idempotency_key,
                    request_method,
                    request_path,
                    request_body_hash,
                    response_status_code,
                    response_body,
                    created_at,
                    updated_at,
                    expires_at
                 ) VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?, ?)
                 ON CONFLICT(tenant_id, idempotency_key) DO NOTHING",
            )
            .bind(&record.id.0)
            .bind(&record.tenant_id.0)
            .bind(&record.idempotency_key.0)
            .bind(&record.request_method)
            .bind(&record.request_path)
            .bind(&record.request_body_hash)
            .bind(encode_timestamp(record.created_at))
            .bind(encode_timestamp(record.updated_at))
            .bind(encode_timestamp(record.expires_at))
            .execute(&self.pool)
            .await?
            .rows_affected();

            if inserted == 1 {
                return Ok(ReserveOutcome::Reserved);
            }

            if let Some(existing) = self.find(&record.tenant_id, &record.idempotency_key).await? {
                return Ok(ReserveOutcome::Existing(existing));
            }
        }

        Err(RepositoryError::Contention(format!(
            "idempotency key `{}` for tenant `{}` kept changing during reservation",
            record.idempotency_key, record.tenant_id
        )))
    }

    async fn reclaim_expired(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            "UPDATE idempotency_keys SET
                id = ?,
                request_method = ?,
                request_path = ?,
                request_body_hash = ?,
                response_status_code = NULL,
                response_body = NULL,
                created_at = ?,
                updated_at = ?,
                expires_at = ?
             WHERE tenant_id = ? AND idempotency_key = ? AND expires_at <= ?",
        )
        .bind(&record.id.0)
        .bind(&record.request_method)
        .bind(&record.request_path)
        .bind(&record.request_body_hash)
        .bind(encode_timestamp(record.created_at))
        .bind(encode_timestamp(record.updated_at))
        .bind(encode_timestamp(record.expires_at))
        .bind(&record.tenant_id.0)
        .bind(&record.idempotency_key.0)
        .bind(encode_timestamp(now))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn find(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS}
             FROM idempotency_keys
             WHERE tenant_id = ? AND idempotency_key = ?"
        ))
        .bind(&tenant_id.0)
        .bind(&key.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn finalize(
        &self,
        id: &IdempotencyRecordId,
        response: &CachedResponse,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let body = encode_json("response_body", &response.body)?;
        let updated = sqlx::query(
            "UPDATE idempotency_keys SET
                response_status_code = ?,
                response_body = ?,
                updated_at = ?
             WHERE id = ? AND response_status_code IS NULL",
        )
        .bind(i64::from(response.status_code))
        .bind(body)
        .bind(encode_timestamp(now))
        .bind(&id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn delete_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, RepositoryError> {
        let deleted = sqlx::query(
            "DELETE FROM idempotency_keys
             WHERE id IN (
                SELECT id FROM idempotency_keys
                WHERE expires_at <= ?
                ORDER BY expires_at ASC
                LIMIT ?
             )",
        )
        .bind(encode_timestamp(now))
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }

    async fn count_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let count = sqlx::query(
            "SELECT COUNT(*) AS count FROM idempotency_keys WHERE expires_at <= ?",
        )
        .bind(encode_timestamp(now))
        .fetch_one(&self.pool)
        .await?
        .try_get::<i64, _>("count")?;

        parse_u64("count", count)
    }
}

fn record_from_row(row: SqliteRow) -> Result<IdempotencyRecord, RepositoryError> {
    let status_code = row.try_get::<Option<i64>, _>("response_status_code")?;
    let body = row.try_get::<Option<String>, _>("response_body")?;

    let response = match (status_code, body) {
        (Some(code), body) => {
            let status_code = u16::try_from(code).map_err(|_| {
                RepositoryError::Decode(format!("invalid response_status_code `{code}`"))
            })?;
            let body = match body {
                Some(raw) => parse_json("response_body", &raw)?,
                None => serde_json::Value::Null,
            };
            Some(CachedResponse { status_code, body })
        }
        (None, _) => None,
    };

    Ok(IdempotencyRecord {
        id: IdempotencyRecordId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        idempotency_key: IdempotencyKey(row.try_get("idempotency_key")?),
        request_method: row.try_get("request_method")?,
        request_path: row.try_get("request_path")?,
        request_body_hash: row.try_get("request_body_hash")?,
        response,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
    })
}

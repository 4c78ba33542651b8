use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use super::{encode_timestamp, LeaseRepository, RepositoryError};
use crate::DbPool;

pub struct SqlLeaseRepository {
    pool: DbPool,
}

impl SqlLeaseRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LeaseRepository for SqlLeaseRepository {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let acquired = sqlx::query(
            "INSERT INTO sweeper_leases (name, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = CASE
                    WHEN sweeper_leases.holder = excluded.holder THEN sweeper_leases.acquired_at
                    ELSE excluded.acquired_at
                END,
                expires_at = excluded.expires_at
             WHERE sweeper_leases.expires_at <= ?3 OR sweeper_leases.holder = excluded.holder",
        )
        .bind(name)
        .bind(holder)
        .bind(encode_timestamp(now))
        .bind(encode_timestamp(now + ttl))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(acquired == 1)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool, RepositoryError> {
        let released = sqlx::query("DELETE FROM sweeper_leases WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(released == 1)
    }

    async fn current_holder(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, RepositoryError> {
        let row = sqlx::query(
            "SELECT holder FROM sweeper_leases WHERE name = ? AND expires_at > ?",
        )
        .bind(name)
        .bind(encode_timestamp(now))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row.try_get::<String, _>("holder").map_err(RepositoryError::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::SqlLeaseRepository;
    use crate::migrations;
    use crate::repositories::LeaseRepository;
    use crate::{connect_with_settings, DbPool};

    const LEASE: &str = "idempotency-expiry";

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry_and_renewable_by_holder() {
        let pool = setup_pool().await;
        let repo = SqlLeaseRepository::new(pool.clone());
        let now = parse_ts("2026-02-23T12:00:00Z");
        let ttl = Duration::seconds(120);

        assert!(repo.try_acquire(LEASE, "node-a", ttl, now).await.expect("acquire"));
        assert!(!repo.try_acquire(LEASE, "node-b", ttl, now).await.expect("contend"));
        assert!(repo
            .try_acquire(LEASE, "node-a", ttl, now + Duration::seconds(60))
            .await
            .expect("renew"));
        assert_eq!(
            repo.current_holder(LEASE, now + Duration::seconds(150)).await.expect("holder"),
            Some("node-a".to_string())
        );

        let after_expiry = now + Duration::seconds(60) + ttl;
        assert!(repo.try_acquire(LEASE, "node-b", ttl, after_expiry).await.expect("take over"));
        assert!(!repo.release(LEASE, "node-a").await.expect("stale release"));
        assert!(repo.release(LEASE, "node-b").await.expect("release"));
        assert_eq!(repo.current_holder(LEASE, after_expiry).await.expect("holder"), None);

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}

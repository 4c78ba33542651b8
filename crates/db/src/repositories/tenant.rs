use sqlx::{sqlite::SqliteRow, Row};

use courier_core::domain::tenant::{ProviderConfigs, Tenant, TenantId};

use super::{
    encode_json, encode_timestamp, parse_json, parse_timestamp, RepositoryError, TenantRepository,
};
use crate::DbPool;

const TENANT_COLUMNS: &str =
    "id, slug, api_key_hash, provider_configs, is_active, created_at, updated_at";

pub struct SqlTenantRepository {
    pool: DbPool,
}

impl SqlTenantRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TenantRepository for SqlTenantRepository {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(tenant_from_row).transpose()
    }

    async fn find_by_api_key_hash(
        &self,
        api_key_hash: &str,
    ) -> Result<Option<Tenant>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE api_key_hash = ?"))
                .bind(api_key_hash)
                .fetch_optional(&self.pool)
                .await?;

        row.map(tenant_from_row).transpose()
    }

    async fn save(&self, tenant: Tenant) -> Result<(), RepositoryError> {
        let provider_configs = encode_json("provider_configs", &tenant.provider_configs)?;

        sqlx::query(
            "INSERT INTO tenants (
                id,
                slug,
                api_key_hash,
                provider_configs,
                is_active,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                slug = excluded.slug,
                api_key_hash = excluded.api_key_hash,
                provider_configs = excluded.provider_configs,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
        )
        .bind(&tenant.id.0)
        .bind(&tenant.slug)
        .bind(&tenant.api_key_hash)
        .bind(provider_configs)
        .bind(tenant.is_active)
        .bind(encode_timestamp(tenant.created_at))
        .bind(encode_timestamp(tenant.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn tenant_from_row(row: SqliteRow) -> Result<Tenant, RepositoryError> {
    let provider_configs_raw = row.try_get::<String, _>("provider_configs")?;
    let provider_configs: ProviderConfigs =
        parse_json("provider_configs", &provider_configs_raw)?;

    Ok(Tenant {
        id: TenantId(row.try_get("id")?),
        slug: row.try_get("slug")?,
        api_key_hash: row.try_get("api_key_hash")?,
        provider_configs,
        is_active: row.try_get("is_active")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

use chrono::{DateTime, Utc};
use serde_json::Value;

use courier_core::domain::action::ProviderCategory;
use courier_core::domain::tenant::{hash_api_key, ProviderConfig, ProviderConfigs, Tenant, TenantId};

use crate::connection::DbPool;
use crate::repositories::{RepositoryError, SqlTenantRepository, TenantRepository};

/// Deterministic demo tenants wired to the sandbox provider.
const SEED_TENANTS: &[SeedTenantContract] = &[
    SeedTenantContract {
        id: "t1",
        slug: "demo-primary",
        api_key: "ck_demo_t1",
        crm_simulate_error: None,
        categories: &[
            ProviderCategory::Crm,
            ProviderCategory::Helpdesk,
            ProviderCategory::Calendar,
            ProviderCategory::Email,
            ProviderCategory::Knowledge,
        ],
        description: "Every category routed to the sandbox provider",
    },
    SeedTenantContract {
        id: "t2",
        slug: "demo-flaky-crm",
        api_key: "ck_demo_t2",
        crm_simulate_error: Some("transient"),
        categories: &[ProviderCategory::Crm],
        description: "Sandbox CRM that always fails transiently; no other categories",
    },
];

const SEED_CREATED_AT: &str = "2026-01-01T00:00:00Z";

pub struct DemoSeedDataset;

impl DemoSeedDataset {
    /// Upserts the demo tenants. Safe to run repeatedly.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let repo = SqlTenantRepository::new(pool.clone());
        let created_at = seed_timestamp()?;

        let mut tenants_seeded = Vec::with_capacity(SEED_TENANTS.len());
        for contract in SEED_TENANTS {
            repo.save(contract.to_tenant(created_at)).await?;
            tenants_seeded.push(SeededTenant {
                tenant_id: contract.id,
                api_key: contract.api_key,
                description: contract.description,
            });
        }

        Ok(SeedResult { tenants_seeded })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let repo = SqlTenantRepository::new(pool.clone());
        let mut checks = Vec::new();

        for contract in SEED_TENANTS {
            let stored = repo.find_by_api_key_hash(&hash_api_key(contract.api_key)).await?;
            let present = stored.as_ref().is_some_and(|tenant| tenant.id.0 == contract.id);
            checks.push((contract.presence_label(), present));

            let routing_matches = stored.as_ref().is_some_and(|tenant| {
                tenant.is_active && tenant.provider_configs == contract.provider_configs()
            });
            checks.push((contract.routing_label(), routing_matches));
        }

        let all_present = checks.iter().all(|(_, passed)| *passed);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes the demo tenants along with their keys and logs.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;
        for contract in SEED_TENANTS {
            sqlx::query("DELETE FROM tenants WHERE id = ?")
                .bind(contract.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SeedTenantContract {
    id: &'static str,
    slug: &'static str,
    api_key: &'static str,
    crm_simulate_error: Option<&'static str>,
    categories: &'static [ProviderCategory],
    description: &'static str,
}

impl SeedTenantContract {
    fn provider_configs(&self) -> ProviderConfigs {
        self.categories
            .iter()
            .map(|category| {
                let mut config = ProviderConfig::named("sandbox");
                if let (ProviderCategory::Crm, Some(mode)) = (category, self.crm_simulate_error) {
                    config = config.with_setting("simulate_error", Value::from(mode));
                }
                (*category, config)
            })
            .collect()
    }

    fn to_tenant(&self, created_at: DateTime<Utc>) -> Tenant {
        Tenant {
            id: TenantId(self.id.to_string()),
            slug: self.slug.to_string(),
            api_key_hash: hash_api_key(self.api_key),
            provider_configs: self.provider_configs(),
            is_active: true,
            created_at,
            updated_at: created_at,
        }
    }

    fn presence_label(&self) -> &'static str {
        match self.id {
            "t1" => "tenant-t1-present",
            _ => "tenant-t2-present",
        }
    }

    fn routing_label(&self) -> &'static str {
        match self.id {
            "t1" => "tenant-t1-routing",
            _ => "tenant-t2-routing",
        }
    }
}

fn seed_timestamp() -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(SEED_CREATED_AT)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid seed timestamp: {error}")))
}

#[derive(Debug)]
pub struct SeedResult {
    pub tenants_seeded: Vec<SeededTenant>,
}

#[derive(Debug)]
pub struct SeededTenant {
    pub tenant_id: &'static str,
    pub api_key: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

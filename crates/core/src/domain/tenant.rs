use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::action::ProviderCategory;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Settings object handed verbatim to a provider factory.
pub type ProviderSettings = Map<String, Value>;

/// Which named provider serves one category for a tenant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: String,
    #[serde(default)]
    pub settings: ProviderSettings,
}

impl ProviderConfig {
    pub fn named(provider: impl Into<String>) -> Self {
        Self { provider: provider.into(), settings: ProviderSettings::new() }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }
}

pub type ProviderConfigs = BTreeMap<ProviderCategory, ProviderConfig>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub slug: String,
    pub api_key_hash: String,
    pub provider_configs: ProviderConfigs,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn provider_config(&self, category: ProviderCategory) -> Option<&ProviderConfig> {
        self.provider_configs.get(&category)
    }
}

/// SHA-256 hex digest used to store and look up tenant API credentials.
pub fn hash_api_key(raw_key: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(raw_key.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

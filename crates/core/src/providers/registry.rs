use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::domain::action::ProviderCategory;
use crate::domain::tenant::{ProviderSettings, Tenant};
use crate::errors::ConfigurationError;
use crate::providers::ProviderHandle;

/// Builds a provider instance from a tenant's settings for one category.
pub type ProviderFactory =
    Arc<dyn Fn(&ProviderSettings) -> Result<ProviderHandle, String> + Send + Sync>;

/// Startup-time table of `(category, name) -> factory`.
///
/// Populated once before the dispatcher is constructed; resolution is a pure
/// lookup followed by the factory call.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<ProviderCategory, BTreeMap<String, ProviderFactory>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub total_providers: usize,
    pub categories: BTreeMap<ProviderCategory, Vec<String>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(
        &mut self,
        category: ProviderCategory,
        name: impl Into<String>,
        factory: F,
    ) -> Result<(), ConfigurationError>
    where
        F: Fn(&ProviderSettings) -> Result<ProviderHandle, String> + Send + Sync + 'static,
    {
        let name = normalize_name(&name.into());
        let providers = self.factories.entry(category).or_default();
        if providers.contains_key(&name) {
            return Err(ConfigurationError::DuplicateRegistration { category, provider: name });
        }

        providers.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn resolve(
        &self,
        tenant: &Tenant,
        category: ProviderCategory,
    ) -> Result<ProviderHandle, ConfigurationError> {
        let config = tenant.provider_config(category).ok_or_else(|| {
            ConfigurationError::MissingCategory { tenant: tenant.id.clone(), category }
        })?;

        let name = normalize_name(&config.provider);
        let factory = self
            .factories
            .get(&category)
            .and_then(|providers| providers.get(&name))
            .ok_or_else(|| ConfigurationError::UnknownProvider {
                category,
                provider: config.provider.clone(),
            })?;

        let handle = factory(&config.settings).map_err(|reason| {
            ConfigurationError::InvalidSettings { category, provider: name.clone(), reason }
        })?;

        if handle.category() != category {
            return Err(ConfigurationError::InvalidSettings {
                category,
                provider: name,
                reason: format!("factory produced a {} provider", handle.category()),
            });
        }

        Ok(handle)
    }

    pub fn is_registered(&self, category: ProviderCategory, name: &str) -> bool {
        self.factories
            .get(&category)
            .is_some_and(|providers| providers.contains_key(&normalize_name(name)))
    }

    pub fn status(&self) -> RegistryStatus {
        let categories: BTreeMap<ProviderCategory, Vec<String>> = self
            .factories
            .iter()
            .map(|(category, providers)| (*category, providers.keys().cloned().collect()))
            .collect();
        let total_providers = categories.values().map(Vec::len).sum();

        RegistryStatus { total_providers, categories }
    }

    pub fn len(&self) -> usize {
        self.factories.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use super::ProviderRegistry;
    use crate::domain::action::ProviderCategory;
    use crate::domain::tenant::{ProviderConfig, Tenant, TenantId};
    use crate::errors::ConfigurationError;
    use crate::providers::{ProviderHandle, SandboxProvider};

    fn tenant(configs: &[(ProviderCategory, ProviderConfig)]) -> Tenant {
        Tenant {
            id: TenantId("t1".to_string()),
            slug: "acme".to_string(),
            api_key_hash: "hash".to_string(),
            provider_configs: configs.iter().cloned().collect::<BTreeMap<_, _>>(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry
            .register(ProviderCategory::Crm, "Sandbox", |settings| {
                let provider = SandboxProvider::from_settings("sandbox", settings)?;
                Ok(ProviderHandle::Crm(Arc::new(provider)))
            })
            .expect("register crm");
        registry
            .register(ProviderCategory::Email, "sandbox", |settings| {
                Ok(ProviderHandle::Email(Arc::new(SandboxProvider::from_settings(
                    "sandbox", settings,
                )?)))
            })
            .expect("register email");
        registry
    }

    #[test]
    fn resolve_uses_tenant_provider_name_for_category() {
        let registry = registry();
        let tenant = tenant(&[(ProviderCategory::Crm, ProviderConfig::named("SANDBOX"))]);

        let handle = registry.resolve(&tenant, ProviderCategory::Crm).expect("resolve crm");

        assert_eq!(handle.category(), ProviderCategory::Crm);
        assert_eq!(handle.name(), "sandbox");
    }

    #[test]
    fn resolve_reports_missing_and_unknown_providers_per_category() {
        let registry = registry();
        let tenant = tenant(&[
            (ProviderCategory::Crm, ProviderConfig::named("salesforce")),
            (ProviderCategory::Email, ProviderConfig::named("sandbox")),
        ]);

        let unknown = registry.resolve(&tenant, ProviderCategory::Crm).expect_err("unknown");
        assert!(matches!(
            unknown,
            ConfigurationError::UnknownProvider { ref provider, .. } if provider == "salesforce"
        ));

        let missing = registry.resolve(&tenant, ProviderCategory::Calendar).expect_err("missing");
        assert!(matches!(
            missing,
            ConfigurationError::MissingCategory { category: ProviderCategory::Calendar, .. }
        ));

        assert!(registry.resolve(&tenant, ProviderCategory::Email).is_ok());
    }

    #[test]
    fn resolve_surfaces_factory_rejections_as_invalid_settings() {
        let registry = registry();
        let tenant = tenant(&[(
            ProviderCategory::Crm,
            ProviderConfig::named("sandbox").with_setting("simulate_error", json!("sometimes")),
        )]);

        let error = registry.resolve(&tenant, ProviderCategory::Crm).expect_err("invalid");
        assert!(matches!(error, ConfigurationError::InvalidSettings { .. }));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = registry();
        let result = registry.register(ProviderCategory::Crm, "sandbox", |settings| {
            Ok(ProviderHandle::Crm(Arc::new(SandboxProvider::from_settings("sandbox", settings)?)))
        });

        assert!(matches!(result, Err(ConfigurationError::DuplicateRegistration { .. })));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn status_lists_registered_providers_by_category() {
        let status = registry().status();

        assert_eq!(status.total_providers, 2);
        assert_eq!(
            status.categories.get(&ProviderCategory::Crm),
            Some(&vec!["sandbox".to_string()])
        );
        assert!(!status.categories.contains_key(&ProviderCategory::Helpdesk));
    }
}

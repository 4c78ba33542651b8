use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::action::{ActionPayload, ProviderCategory};
use crate::domain::idempotency::hash_request_body;
use crate::domain::tenant::ProviderSettings;
use crate::errors::ConfigurationError;
use crate::providers::{
    CalendarProvider, CrmProvider, EmailProvider, HelpdeskProvider, KnowledgeProvider,
    ProviderError, ProviderHandle, ProviderRegistry, ProviderResult,
};

pub const SANDBOX_PROVIDER_NAME: &str = "sandbox";

type SandboxStore = Arc<Mutex<BTreeMap<String, ActionPayload>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SimulatedError {
    Transient,
    Permanent,
}

/// In-process provider that records payloads instead of calling a remote API.
///
/// `settings.simulate_error = "transient" | "permanent"` makes every call fail
/// with that class, which is how demo tenants exercise the retry policy.
#[derive(Clone)]
pub struct SandboxProvider {
    name: String,
    simulate_error: Option<SimulatedError>,
    store: SandboxStore,
}

impl SandboxProvider {
    pub fn from_settings(name: &str, settings: &ProviderSettings) -> Result<Self, String> {
        Self::with_store(name, settings, SandboxStore::default())
    }

    fn with_store(
        name: &str,
        settings: &ProviderSettings,
        store: SandboxStore,
    ) -> Result<Self, String> {
        let simulate_error = match settings.get("simulate_error") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => match raw.trim().to_ascii_lowercase().as_str() {
                "transient" => Some(SimulatedError::Transient),
                "permanent" => Some(SimulatedError::Permanent),
                other => {
                    return Err(format!(
                        "unsupported simulate_error `{other}` (expected transient|permanent)"
                    ))
                }
            },
            Some(other) => return Err(format!("simulate_error must be a string, got {other}")),
        };

        Ok(Self { name: name.to_string(), simulate_error, store })
    }

    fn record(
        &self,
        category: ProviderCategory,
        operation: &str,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        match self.simulate_error {
            Some(SimulatedError::Transient) => {
                return Err(ProviderError::transient(
                    "sandbox_unavailable",
                    format!("sandbox {category} provider simulated a transient failure"),
                ))
            }
            Some(SimulatedError::Permanent) => {
                return Err(ProviderError::permanent(
                    "sandbox_rejected",
                    format!("sandbox {category} provider simulated a permanent failure"),
                ))
            }
            None => {}
        }

        let digest = hash_request_body(&Value::Object(payload.clone()));
        let external_id = format!("sbx_{}_{}", category.as_str(), &digest[..16]);

        let mut store = match self.store.lock() {
            Ok(store) => store,
            Err(poisoned) => poisoned.into_inner(),
        };
        store.insert(external_id.clone(), payload.clone());

        Ok(ProviderResult {
            external_id: external_id.clone(),
            raw_response: json!({
                "id": external_id,
                "operation": operation,
                "provider": self.name,
            }),
        })
    }
}

#[async_trait]
impl CrmProvider for SandboxProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_record(
        &self,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        self.record(ProviderCategory::Crm, "create_record", payload)
    }

    async fn update_record(
        &self,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        let record_id = payload.get("record_id").and_then(Value::as_str).unwrap_or_default();
        let mut store = match self.store.lock() {
            Ok(store) => store,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(existing) = store.get_mut(record_id) else {
            return Err(ProviderError::permanent(
                "record_not_found",
                format!("sandbox crm record `{record_id}` does not exist"),
            ));
        };

        for (key, value) in payload.iter().filter(|(key, _)| key.as_str() != "record_id") {
            existing.insert(key.clone(), value.clone());
        }

        Ok(ProviderResult {
            external_id: record_id.to_string(),
            raw_response: json!({"id": record_id, "operation": "update_record"}),
        })
    }

    async fn find_record(
        &self,
        query: &ActionPayload,
    ) -> Result<Option<ProviderResult>, ProviderError> {
        let store = match self.store.lock() {
            Ok(store) => store,
            Err(poisoned) => poisoned.into_inner(),
        };

        let found = store.iter().find(|(_, fields)| {
            query.iter().all(|(key, expected)| fields.get(key) == Some(expected))
        });

        Ok(found.map(|(id, fields)| ProviderResult {
            external_id: id.clone(),
            raw_response: Value::Object(fields.clone()),
        }))
    }
}

#[async_trait]
impl HelpdeskProvider for SandboxProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_ticket(
        &self,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        self.record(ProviderCategory::Helpdesk, "create_ticket", payload)
    }
}

#[async_trait]
impl CalendarProvider for SandboxProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_event(&self, payload: &ActionPayload) -> Result<ProviderResult, ProviderError> {
        self.record(ProviderCategory::Calendar, "create_event", payload)
    }
}

#[async_trait]
impl EmailProvider for SandboxProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_email(&self, payload: &ActionPayload) -> Result<ProviderResult, ProviderError> {
        self.record(ProviderCategory::Email, "send_email", payload)
    }
}

#[async_trait]
impl KnowledgeProvider for SandboxProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store_document(
        &self,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        self.record(ProviderCategory::Knowledge, "store_document", payload)
    }
}

/// Registers the sandbox provider for every category, sharing one record store.
pub fn register_sandbox(registry: &mut ProviderRegistry) -> Result<(), ConfigurationError> {
    let store = SandboxStore::default();

    for category in ProviderCategory::ALL {
        let store = store.clone();
        registry.register(category, SANDBOX_PROVIDER_NAME, move |settings| {
            let provider = Arc::new(SandboxProvider::with_store(
                SANDBOX_PROVIDER_NAME,
                settings,
                store.clone(),
            )?);
            Ok(match category {
                ProviderCategory::Crm => ProviderHandle::Crm(provider),
                ProviderCategory::Helpdesk => ProviderHandle::Helpdesk(provider),
                ProviderCategory::Calendar => ProviderHandle::Calendar(provider),
                ProviderCategory::Email => ProviderHandle::Email(provider),
                ProviderCategory::Knowledge => ProviderHandle::Knowledge(provider),
            })
        })?;
    }

    Ok(())
}

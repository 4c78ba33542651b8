//! Generic JSON-over-HTTP provider.
//!
//! Tenants point a category at `{"provider": "webhook", "settings": {"url": ...}}`.
//! Every capability becomes a POST of `{category, operation, payload}` to that
//! URL; the receiver answers with a JSON object carrying `id` or `external_id`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use courier_core::config::WebhookConfig;
use courier_core::domain::action::{ActionPayload, ProviderCategory};
use courier_core::domain::tenant::ProviderSettings;
use courier_core::errors::ConfigurationError;
use courier_core::providers::{
    CalendarProvider, CrmProvider, EmailProvider, HelpdeskProvider, KnowledgeProvider,
    ProviderError, ProviderHandle, ProviderRegistry, ProviderResult,
};

pub const WEBHOOK_PROVIDER_NAME: &str = "webhook";

#[derive(Clone)]
pub struct WebhookProvider {
    category: ProviderCategory,
    client: Client,
    url: String,
    token: Option<SecretString>,
}

impl WebhookProvider {
    /// Builds a provider from tenant settings. `settings.token` overrides the
    /// process-wide bearer token.
    pub fn from_settings(
        category: ProviderCategory,
        client: Client,
        default_token: Option<SecretString>,
        settings: &ProviderSettings,
    ) -> Result<Self, String> {
        let url = settings
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| "webhook settings require a non-empty `url`".to_string())?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("webhook url `{url}` must use http or https"));
        }

        let token = match settings.get("token") {
            Some(Value::String(token)) if !token.trim().is_empty() => {
                Some(SecretString::from(token.trim().to_string()))
            }
            Some(Value::String(_)) | Some(Value::Null) | None => default_token,
            Some(_) => return Err("webhook `token` must be a string".to_string()),
        };

        Ok(Self { category, client, url: url.to_string(), token })
    }

    async fn post(
        &self,
        operation: &str,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        let mut request = self.client.post(&self.url).json(&json!({
            "category": self.category.as_str(),
            "operation": operation,
            "payload": payload,
        }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|error| classify_send_error(&error))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if let Some(error) = classify_status(status, &body) {
            return Err(error);
        }

        let external_id = body
            .get("external_id")
            .or_else(|| body.get("id"))
            .and_then(|id| match id {
                Value::String(id) => Some(id.clone()),
                Value::Number(id) => Some(id.to_string()),
                _ => None,
            })
            .ok_or_else(|| {
                ProviderError::permanent(
                    "webhook_missing_id",
                    "webhook response did not include `id` or `external_id`",
                )
            })?;

        Ok(ProviderResult { external_id, raw_response: body })
    }
}

/// 429 and 5xx are worth retrying; any other non-success status is final.
fn classify_status(status: StatusCode, body: &Value) -> Option<ProviderError> {
    if status.is_success() {
        return None;
    }

    let message = body
        .get("message")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("webhook answered {status}"));

    Some(if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::transient(format!("webhook_http_{}", status.as_u16()), message)
    } else {
        ProviderError::permanent(format!("webhook_http_{}", status.as_u16()), message)
    })
}

#[async_trait]
impl CrmProvider for WebhookProvider {
    fn name(&self) -> &str {
        WEBHOOK_PROVIDER_NAME
    }

    async fn create_record(
        &self,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        self.post("create_record", payload).await
    }

    async fn update_record(
        &self,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        self.post("update_record", payload).await
    }

    async fn find_record(
        &self,
        query: &ActionPayload,
    ) -> Result<Option<ProviderResult>, ProviderError> {
        match self.post("find_record", query).await {
            Ok(result) => Ok(Some(result)),
            Err(error) if error.code == "webhook_http_404" => Ok(None),
            Err(error) => Err(error),
        }
    }
}

#[async_trait]
impl HelpdeskProvider for WebhookProvider {
    fn name(&self) -> &str {
        WEBHOOK_PROVIDER_NAME
    }

    async fn create_ticket(
        &self,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        self.post("create_ticket", payload).await
    }
}

#[async_trait]
impl CalendarProvider for WebhookProvider {
    fn name(&self) -> &str {
        WEBHOOK_PROVIDER_NAME
    }

    async fn create_event(&self, payload: &ActionPayload) -> Result<ProviderResult, ProviderError> {
        self.post("create_event", payload).await
    }
}

#[async_trait]
impl EmailProvider for WebhookProvider {
    fn name(&self) -> &str {
        WEBHOOK_PROVIDER_NAME
    }

    async fn send_email(&self, payload: &ActionPayload) -> Result<ProviderResult, ProviderError> {
        self.post("send_email", payload).await
    }
}

#[async_trait]
impl KnowledgeProvider for WebhookProvider {
    fn name(&self) -> &str {
        WEBHOOK_PROVIDER_NAME
    }

    async fn store_document(
        &self,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        self.post("store_document", payload).await
    }
}

/// A timed-out request may already have been delivered, so it is never
/// retried. Only failures to connect are safe to repeat.
fn classify_send_error(error: &reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::timeout("webhook_timeout", error.to_string())
    } else if error.is_connect() {
        ProviderError::transient("webhook_unreachable", error.to_string())
    } else {
        ProviderError::permanent("webhook_request_failed", error.to_string())
    }
}

/// Registers the webhook provider for every category over one shared client.
pub fn register_webhook(
    registry: &mut ProviderRegistry,
    config: &WebhookConfig,
) -> Result<(), ConfigurationError> {
    let client = Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs.max(1)))
        .build()
        .map_err(|error| ConfigurationError::InvalidSettings {
            category: ProviderCategory::Crm,
            provider: WEBHOOK_PROVIDER_NAME.to_string(),
            reason: format!("http client could not be built: {error}"),
        })?;

    for category in ProviderCategory::ALL {
        let client = client.clone();
        let token = config.token.clone();
        registry.register(category, WEBHOOK_PROVIDER_NAME, move |settings| {
            let provider = Arc::new(WebhookProvider::from_settings(
                category,
                client.clone(),
                token.clone(),
                settings,
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

//! Provider capability contract.
//!
//! Each category exposes exactly its own capability set. Providers receive a
//! normalized payload and answer with a normalized result or a classified
//! [`ProviderError`]; they never touch action-log state.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::action::{ActionPayload, ActionType, ProviderCategory};

pub mod registry;
pub mod sandbox;

pub use registry::{ProviderFactory, ProviderRegistry, RegistryStatus};
pub use sandbox::SandboxProvider;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub external_id: String,
    pub raw_response: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Rate limiting, network failure, upstream 5xx; eligible for retry.
    Transient,
    /// Authorization or validation failure that a retry cannot fix.
    Permanent,
    /// The provider gave up waiting after the request may have been delivered.
    /// Ends the action in `TIMEOUT`; never retried.
    Timeout,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind:?} provider error `{code}`: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub code: String,
    pub message: String,
}

impl ProviderError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Transient, code: code.into(), message: message.into() }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Permanent, code: code.into(), message: message.into() }
    }

    pub fn timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Timeout, code: code.into(), message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::Transient)
    }
}

#[async_trait]
pub trait CrmProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn create_record(&self, payload: &ActionPayload) -> Result<ProviderResult, ProviderError>;
    async fn update_record(&self, payload: &ActionPayload) -> Result<ProviderResult, ProviderError>;
    async fn find_record(
        &self,
        query: &ActionPayload,
    ) -> Result<Option<ProviderResult>, ProviderError>;
}

#[async_trait]
pub trait HelpdeskProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn create_ticket(&self, payload: &ActionPayload) -> Result<ProviderResult, ProviderError>;
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn create_event(&self, payload: &ActionPayload) -> Result<ProviderResult, ProviderError>;
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn send_email(&self, payload: &ActionPayload) -> Result<ProviderResult, ProviderError>;
}

#[async_trait]
pub trait KnowledgeProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn store_document(
        &self,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError>;
}

/// A resolved provider, tagged with the category it serves.
#[derive(Clone)]
pub enum ProviderHandle {
    Crm(Arc<dyn CrmProvider>),
    Helpdesk(Arc<dyn HelpdeskProvider>),
    Calendar(Arc<dyn CalendarProvider>),
    Email(Arc<dyn EmailProvider>),
    Knowledge(Arc<dyn KnowledgeProvider>),
}

impl ProviderHandle {
    pub fn category(&self) -> ProviderCategory {
        match self {
            Self::Crm(_) => ProviderCategory::Crm,
            Self::Helpdesk(_) => ProviderCategory::Helpdesk,
            Self::Calendar(_) => ProviderCategory::Calendar,
            Self::Email(_) => ProviderCategory::Email,
            Self::Knowledge(_) => ProviderCategory::Knowledge,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Crm(provider) => provider.name(),
            Self::Helpdesk(provider) => provider.name(),
            Self::Calendar(provider) => provider.name(),
            Self::Email(provider) => provider.name(),
            Self::Knowledge(provider) => provider.name(),
        }
    }

    /// Runs the capability that backs `action_type`.
    pub async fn execute(
        &self,
        action_type: ActionType,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        match (action_type, self) {
            (ActionType::CrmCreate, Self::Crm(provider)) => provider.create_record(payload).await,
            (ActionType::CrmUpdate, Self::Crm(provider)) => provider.update_record(payload).await,
            (ActionType::HelpdeskCreateTicket, Self::Helpdesk(provider)) => {
                provider.create_ticket(payload).await
            }
            (ActionType::CalendarCreateEvent, Self::Calendar(provider)) => {
                provider.create_event(payload).await
            }
            (ActionType::EmailSend, Self::Email(provider)) => provider.send_email(payload).await,
            (ActionType::KnowledgeStore, Self::Knowledge(provider)) => {
                provider.store_document(payload).await
            }
            (action_type, handle) => Err(ProviderError::permanent(
                "capability_mismatch",
                format!(
                    "{} provider `{}` cannot execute {action_type}",
                    handle.category(),
                    handle.name()
                ),
            )),
        }
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("category", &self.category())
            .field("name", &self.name())
            .finish()
    }
}

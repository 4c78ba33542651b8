use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::idempotency::IdempotencyKey;
use crate::domain::tenant::TenantId;

/// Opaque per-action JSON payload handed to providers.
pub type ActionPayload = Map<String, Value>;

/// Free-form metadata stored verbatim in `action_logs.action_metadata`.
pub type ActionMetadata = Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionLogId(pub String);

impl fmt::Display for ActionLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderCategory {
    Crm,
    Helpdesk,
    Calendar,
    Email,
    Knowledge,
}

impl ProviderCategory {
    pub const ALL: [Self; 5] =
        [Self::Crm, Self::Helpdesk, Self::Calendar, Self::Email, Self::Knowledge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crm => "crm",
            Self::Helpdesk => "helpdesk",
            Self::Calendar => "calendar",
            Self::Email => "email",
            Self::Knowledge => "knowledge",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "crm" => Some(Self::Crm),
            "helpdesk" => Some(Self::Helpdesk),
            "calendar" => Some(Self::Calendar),
            "email" => Some(Self::Email),
            "knowledge" => Some(Self::Knowledge),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    CrmCreate,
    CrmUpdate,
    HelpdeskCreateTicket,
    CalendarCreateEvent,
    EmailSend,
    KnowledgeStore,
}

impl ActionType {
    pub const ALL: [Self; 6] = [
        Self::CrmCreate,
        Self::CrmUpdate,
        Self::HelpdeskCreateTicket,
        Self::CalendarCreateEvent,
        Self::EmailSend,
        Self::KnowledgeStore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CrmCreate => "CRM_CREATE",
            Self::CrmUpdate => "CRM_UPDATE",
            Self::HelpdeskCreateTicket => "HELPDESK_CREATE_TICKET",
            Self::CalendarCreateEvent => "CALENDAR_CREATE_EVENT",
            Self::EmailSend => "EMAIL_SEND",
            Self::KnowledgeStore => "KNOWLEDGE_STORE",
        }
    }

    /// Accepts the storage encoding as well as lower/kebab-case path segments.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "CRM_CREATE" => Some(Self::CrmCreate),
            "CRM_UPDATE" => Some(Self::CrmUpdate),
            "HELPDESK_CREATE_TICKET" => Some(Self::HelpdeskCreateTicket),
            "CALENDAR_CREATE_EVENT" => Some(Self::CalendarCreateEvent),
            "EMAIL_SEND" => Some(Self::EmailSend),
            "KNOWLEDGE_STORE" => Some(Self::KnowledgeStore),
            _ => None,
        }
    }

    pub fn category(&self) -> ProviderCategory {
        match self {
            Self::CrmCreate | Self::CrmUpdate => ProviderCategory::Crm,
            Self::HelpdeskCreateTicket => ProviderCategory::Helpdesk,
            Self::CalendarCreateEvent => ProviderCategory::Calendar,
            Self::EmailSend => ProviderCategory::Email,
            Self::KnowledgeStore => ProviderCategory::Knowledge,
        }
    }

    fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::CrmCreate => &[],
            Self::CrmUpdate => &["record_id"],
            Self::HelpdeskCreateTicket => &["subject"],
            Self::CalendarCreateEvent => &["title", "start"],
            Self::EmailSend => &["to", "subject"],
            Self::KnowledgeStore => &["content"],
        }
    }

    /// Normalizes a raw request body into the payload shape providers receive.
    pub fn validate_payload(&self, body: &Value) -> Result<ActionPayload, PayloadError> {
        let payload = body.as_object().ok_or(PayloadError::NotAnObject)?;
        if payload.is_empty() {
            return Err(PayloadError::Empty(*self));
        }

        for field in self.required_fields() {
            let present = match payload.get(*field) {
                None | Some(Value::Null) => false,
                Some(Value::String(value)) => !value.trim().is_empty(),
                Some(_) => true,
            };
            if !present {
                return Err(PayloadError::MissingField { action_type: *self, field: *field });
            }
        }

        Ok(payload.clone())
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("action payload must be a JSON object")]
    NotAnObject,
    #[error("action payload for {0} must not be empty")]
    Empty(ActionType),
    #[error("action payload for {action_type} is missing required field `{field}`")]
    MissingField { action_type: ActionType, field: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Pending,
    Retry,
    Success,
    Failure,
    Timeout,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Retry => "RETRY",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "RETRY" => Some(Self::Retry),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            "TIMEOUT" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Pending | Self::Retry => false,
            Self::Success | Self::Failure | Self::Timeout => true,
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    pub id: ActionLogId,
    pub tenant_id: TenantId,
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub attempt_count: u32,
    pub latency_ms: Option<u64>,
    pub idempotency_key: Option<IdempotencyKey>,
    pub metadata: ActionMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

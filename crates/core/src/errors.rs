use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::action::ProviderCategory;
use crate::domain::tenant::TenantId;
use crate::providers::{ProviderError, ProviderErrorKind};

/// Closed taxonomy every dispatch outcome is classified under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    InProgress,
    Configuration,
    ProviderTransient,
    ProviderPermanent,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::InProgress => "in_progress",
            Self::Configuration => "configuration",
            Self::ProviderTransient => "provider_transient",
            Self::ProviderPermanent => "provider_permanent",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }

    /// Status code written into cached responses. Transport mapping beyond the
    /// cached body belongs to the ingress layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Conflict | Self::InProgress => 409,
            Self::Configuration | Self::ProviderPermanent => 422,
            Self::ProviderTransient => 502,
            Self::Timeout => 504,
            Self::Internal => 500,
        }
    }
}

/// Last error recorded for an action; kept in metadata and cached responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl ActionFailure {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, code: code.into(), message: message.into() }
    }
}

impl From<&ProviderError> for ActionFailure {
    fn from(error: &ProviderError) -> Self {
        let kind = match error.kind {
            ProviderErrorKind::Transient => ErrorKind::ProviderTransient,
            ProviderErrorKind::Permanent => ErrorKind::ProviderPermanent,
            ProviderErrorKind::Timeout => ErrorKind::Timeout,
        };
        Self::new(kind, error.code.clone(), error.message.clone())
    }
}

impl From<&ConfigurationError> for ActionFailure {
    fn from(error: &ConfigurationError) -> Self {
        Self::new(ErrorKind::Configuration, error.code(), error.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("tenant `{tenant}` has no provider configured for category `{category}`")]
    MissingCategory { tenant: TenantId, category: ProviderCategory },
    #[error("provider `{provider}` is not registered for category `{category}`")]
    UnknownProvider { category: ProviderCategory, provider: String },
    #[error("provider `{provider}` rejected settings for category `{category}`: {reason}")]
    InvalidSettings { category: ProviderCategory, provider: String, reason: String },
    #[error("provider `{provider}` is already registered for category `{category}`")]
    DuplicateRegistration { category: ProviderCategory, provider: String },
}

impl ConfigurationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCategory { .. } => "provider_not_configured",
            Self::UnknownProvider { .. } => "provider_unknown",
            Self::InvalidSettings { .. } => "provider_settings_invalid",
            Self::DuplicateRegistration { .. } => "provider_duplicate",
        }
    }
}

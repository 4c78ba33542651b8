pub mod config;
pub mod domain;
pub mod errors;
pub mod providers;
pub mod state_machine;

pub use domain::action::{
    ActionLog, ActionLogId, ActionMetadata, ActionPayload, ActionStatus, ActionType,
    PayloadError, ProviderCategory,
};
pub use domain::idempotency::{
    hash_request_body, CachedResponse, IdempotencyKey, IdempotencyRecord, IdempotencyRecordId,
};
pub use domain::tenant::{hash_api_key, ProviderConfig, ProviderConfigs, Tenant, TenantId};
pub use errors::{ActionFailure, ConfigurationError, ErrorKind};
pub use providers::{
    ProviderError, ProviderErrorKind, ProviderHandle, ProviderRegistry, ProviderResult,
    RegistryStatus,
};
pub use state_machine::{ActionStateMachine, NextStep, RetryPolicy, TransitionError};

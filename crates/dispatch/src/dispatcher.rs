//! Action dispatcher.
//!
//! Runs one action end to end: payload validation, the idempotency guard,
//! provider resolution, bounded retries and the terminal write. The run is
//! moved onto its own task so a caller that goes away cannot cut an attempt
//! or its terminal write short.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use courier_core::domain::action::{ActionLog, ActionLogId, ActionPayload, ActionStatus, ActionType};
use courier_core::domain::idempotency::{CachedResponse, IdempotencyKey};
use courier_core::domain::tenant::Tenant;
use courier_core::errors::ErrorKind;
use courier_core::providers::{ProviderError, ProviderHandle, ProviderRegistry, ProviderResult};
use courier_core::state_machine::{last_failure, ActionStateMachine, NextStep, TransitionError};
use courier_db::repositories::{ActionLogRepository, RepositoryError};

use crate::guard::{
    ConflictReason, GuardDecision, GuardError, GuardRequest, IdempotencyGuard, Reservation,
};

#[derive(Clone, Debug)]
pub struct ActionRequest {
    pub tenant: Tenant,
    pub action_type: ActionType,
    pub idempotency_key: Option<IdempotencyKey>,
    pub method: String,
    pub path: String,
    pub body: Value,
    pub correlation_id: String,
}

impl ActionRequest {
    pub fn new(tenant: Tenant, action_type: ActionType, body: Value) -> Self {
        Self {
            tenant,
            action_type,
            idempotency_key: None,
            method: "POST".to_string(),
            path: format!("/v1/actions/{}", action_type.as_str()),
            body,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    pub fn with_route(mut self, method: impl Into<String>, path: impl Into<String>) -> Self {
        self.method = method.into();
        self.path = path.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

/// Terminal result of a dispatch, fresh or replayed.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchOutcome {
    pub action_id: ActionLogId,
    pub status: ActionStatus,
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    pub replayed: bool,
    pub response: CachedResponse,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid payload: {message}")]
    Validation { action_id: ActionLogId, message: String, response: CachedResponse },
    #[error(
        "idempotency key `{key}` was already used for a different request ({})",
        reason.as_str()
    )]
    Conflict { key: IdempotencyKey, reason: ConflictReason },
    #[error("idempotency key `{key}` is still being processed")]
    InProgress { key: IdempotencyKey, retry_after_ms: u64 },
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("internal dispatch error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::InProgress { .. } => ErrorKind::InProgress,
            Self::Guard(_) | Self::Repository(_) | Self::Transition(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

enum AttemptResult {
    Completed(Result<ProviderResult, ProviderError>),
    TimedOut,
    Crashed(String),
}

#[derive(Clone)]
pub struct ActionDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: ProviderRegistry,
    guard: IdempotencyGuard,
    action_logs: Arc<dyn ActionLogRepository>,
    state_machine: ActionStateMachine,
}

impl ActionDispatcher {
    pub fn new(
        registry: ProviderRegistry,
        guard: IdempotencyGuard,
        action_logs: Arc<dyn ActionLogRepository>,
        state_machine: ActionStateMachine,
    ) -> Self {
        Self { inner: Arc::new(DispatcherInner { registry, guard, action_logs, state_machine }) }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.inner.guard
    }

    pub async fn dispatch(&self, request: ActionRequest) -> Result<DispatchOutcome, DispatchError> {
        let inner = Arc::clone(&self.inner);
        let correlation_id = request.correlation_id.clone();

        match tokio::spawn(async move { inner.process(request).await }).await {
            Ok(result) => result,
            Err(join_error) => {
                error!(
                    event_name = "dispatch.task.crashed",
                    correlation_id = %correlation_id,
                    error = %join_error,
                    "dispatch task terminated abnormally"
                );
                Err(DispatchError::Internal(join_error.to_string()))
            }
        }
    }
}

impl DispatcherInner {
    async fn process(&self, request: ActionRequest) -> Result<DispatchOutcome, DispatchError> {
        let ActionRequest {
            tenant,
            action_type,
            idempotency_key,
            method,
            path,
            body,
            correlation_id,
        } = request;

        let payload = match action_type.validate_payload(&body) {
            Ok(payload) => payload,
            Err(validation) => {
                let log = self.state_machine.validation_failure_log(
                    tenant.id.clone(),
                    action_type,
                    idempotency_key,
                    validation.to_string(),
                );
                self.action_logs.insert(&log).await?;
                warn!(
                    event_name = "dispatch.action.rejected",
                    correlation_id = %correlation_id,
                    tenant_id = %tenant.id.0,
                    action_id = %log.id,
                    action_type = %action_type,
                    error = %validation,
                    "action payload rejected"
                );
                return Err(DispatchError::Validation {
                    response: self.state_machine.response_for(&log),
                    action_id: log.id,
                    message: validation.to_string(),
                });
            }
        };

        let reservation = match &idempotency_key {
            None => None,
            Some(key) => {
                let decision = self
                    .guard
                    .check_or_reserve(GuardRequest {
                        tenant_id: &tenant.id,
                        key,
                        method: &method,
                        path: &path,
                        body: &body,
                    })
                    .await?;

                match decision {
                    GuardDecision::New(reservation) => Some(reservation),
                    GuardDecision::Duplicate(cached) => {
                        return self
                            .replay(&tenant, action_type, key.clone(), cached, &correlation_id)
                            .await;
                    }
                    GuardDecision::Conflict(reason) => {
                        warn!(
                            event_name = "dispatch.action.conflict",
                            correlation_id = %correlation_id,
                            tenant_id = %tenant.id.0,
                            idempotency_key = %key,
                            reason = reason.as_str(),
                            "idempotency key reused with a different request"
                        );
                        return Err(DispatchError::Conflict { key: key.clone(), reason });
                    }
                    GuardDecision::InProgress { retry_after_ms } => {
                        return Err(DispatchError::InProgress { key: key.clone(), retry_after_ms });
                    }
                }
            }
        };

        let mut log = self.state_machine.new_log(tenant.id.clone(), action_type, idempotency_key);
        match self.drive(&tenant, &mut log, payload, reservation.as_ref(), &correlation_id).await {
            Ok(outcome) => Ok(outcome),
            Err(dispatch_error) => {
                self.abandon(&mut log, reservation.as_ref(), &dispatch_error, &correlation_id)
                    .await;
                Err(match dispatch_error {
                    DispatchError::Internal(message) => DispatchError::Internal(message),
                    other => DispatchError::Internal(other.to_string()),
                })
            }
        }
    }

    async fn drive(
        &self,
        tenant: &Tenant,
        log: &mut ActionLog,
        payload: ActionPayload,
        reservation: Option<&Reservation>,
        correlation_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.action_logs.insert(log).await?;
        info!(
            event_name = "dispatch.action.started",
            correlation_id = %correlation_id,
            tenant_id = %tenant.id.0,
            action_id = %log.id,
            action_type = %log.action_type,
            "action dispatch started"
        );

        self.run(tenant, log, payload, correlation_id).await?;
        self.finish(log, reservation, correlation_id).await
    }

    /// Best-effort cleanup after a storage or transition error past the
    /// reservation: the log ends in `FAILURE` (kind `internal`) unless it
    /// already reached a terminal status, and the reservation is finalized
    /// with the matching response so the key does not stay in flight.
    async fn abandon(
        &self,
        log: &mut ActionLog,
        reservation: Option<&Reservation>,
        cause: &DispatchError,
        correlation_id: &str,
    ) {
        error!(
            event_name = "dispatch.action.abandoned",
            correlation_id = %correlation_id,
            tenant_id = %log.tenant_id.0,
            action_id = %log.id,
            status = %log.status,
            error = %cause,
            "dispatch failed after the key was reserved"
        );

        if !log.status.is_terminal() {
            if let Err(transition) = self.state_machine.on_internal_error(log, cause.to_string()) {
                error!(
                    event_name = "dispatch.action.abandon_transition_failed",
                    correlation_id = %correlation_id,
                    action_id = %log.id,
                    error = %transition,
                    "could not mark abandoned action as failed"
                );
            }
        }

        let persisted = match self.action_logs.update(log).await {
            Ok(true) => Ok(()),
            Ok(false) => match self.action_logs.find_by_id(&log.id).await {
                Ok(Some(_)) => Ok(()),
                Ok(None) => self.action_logs.insert(log).await,
                Err(lookup_error) => Err(lookup_error),
            },
            Err(update_error) => Err(update_error),
        };
        if let Err(repository_error) = persisted {
            error!(
                event_name = "dispatch.action.terminal_write_failed",
                correlation_id = %correlation_id,
                action_id = %log.id,
                error = %repository_error,
                "terminal status for abandoned action could not be stored"
            );
        }

        let Some(reservation) = reservation else {
            return;
        };
        let response = self.state_machine.response_for(log);
        if let Err(guard_error) = self.guard.finalize(reservation, &response).await {
            error!(
                event_name = "dispatch.guard.finalize_failed",
                correlation_id = %correlation_id,
                action_id = %log.id,
                idempotency_key = %reservation.key,
                error = %guard_error,
                "idempotency reservation for abandoned action could not be finalized"
            );
        }
    }

    async fn replay(
        &self,
        tenant: &Tenant,
        action_type: ActionType,
        key: IdempotencyKey,
        cached: CachedResponse,
        correlation_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let log = self.state_machine.replayed_log(tenant.id.clone(), action_type, key, &cached);
        self.action_logs.insert(&log).await?;
        info!(
            event_name = "dispatch.action.replayed",
            correlation_id = %correlation_id,
            tenant_id = %tenant.id.0,
            action_id = %log.id,
            status = %log.status,
            "cached response replayed"
        );

        let attempts = cached
            .body
            .get("attempts")
            .and_then(Value::as_u64)
            .and_then(|attempts| u32::try_from(attempts).ok())
            .unwrap_or(0);
        let error_kind = cached
            .body
            .pointer("/error/kind")
            .cloned()
            .and_then(|kind| serde_json::from_value(kind).ok());

        Ok(DispatchOutcome {
            action_id: log.id,
            status: log.status,
            attempts,
            error_kind,
            replayed: true,
            response: cached,
        })
    }

    /// Drives `log` from `PENDING` to a terminal status.
    async fn run(
        &self,
        tenant: &Tenant,
        log: &mut ActionLog,
        payload: ActionPayload,
        correlation_id: &str,
    ) -> Result<(), DispatchError> {
        let provider = match self.registry.resolve(tenant, log.action_type.category()) {
            Ok(provider) => provider,
            Err(configuration) => {
                warn!(
                    event_name = "dispatch.provider.unresolved",
                    correlation_id = %correlation_id,
                    tenant_id = %tenant.id.0,
                    action_id = %log.id,
                    error = %configuration,
                    "provider could not be resolved"
                );
                self.state_machine.on_configuration_error(log, &configuration)?;
                return Ok(());
            }
        };

        let started = Instant::now();
        loop {
            let attempt = self.state_machine.begin_attempt(log)?;
            let result = self.attempt(&provider, log.action_type, &payload).await;
            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match result {
                AttemptResult::Completed(Ok(result)) => {
                    self.state_machine.on_success(log, provider.name(), result, latency_ms)?;
                    return Ok(());
                }
                AttemptResult::Completed(Err(provider_error)) => {
                    let next = self.state_machine.on_provider_error(
                        log,
                        provider.name(),
                        &provider_error,
                        latency_ms,
                    )?;
                    match next {
                        NextStep::Terminal => return Ok(()),
                        NextStep::RetryAfter(delay) => {
                            warn!(
                                event_name = "dispatch.attempt.retry",
                                correlation_id = %correlation_id,
                                action_id = %log.id,
                                provider = provider.name(),
                                attempt,
                                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                error = %provider_error,
                                "transient provider failure, retrying"
                            );
                            self.action_logs.update(log).await?;
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                AttemptResult::TimedOut => {
                    self.state_machine.on_timeout(log, provider.name(), latency_ms)?;
                    return Ok(());
                }
                AttemptResult::Crashed(message) => {
                    self.state_machine.on_internal_error(log, message)?;
                    return Ok(());
                }
            }
        }
    }

    /// One provider call under the attempt timeout. The call runs on its own
    /// task so a panicking provider fails the action instead of the dispatcher.
    async fn attempt(
        &self,
        provider: &ProviderHandle,
        action_type: ActionType,
        payload: &ActionPayload,
    ) -> AttemptResult {
        let provider = provider.clone();
        let payload = payload.clone();
        let mut call =
            tokio::spawn(async move { provider.execute(action_type, &payload).await });

        match tokio::time::timeout(self.state_machine.policy().attempt_timeout, &mut call).await {
            Ok(Ok(result)) => AttemptResult::Completed(result),
            Ok(Err(join_error)) => {
                AttemptResult::Crashed(format!("provider task failed: {join_error}"))
            }
            Err(_) => {
                call.abort();
                AttemptResult::TimedOut
            }
        }
    }

    async fn finish(
        &self,
        log: &ActionLog,
        reservation: Option<&Reservation>,
        correlation_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        if !self.action_logs.update(log).await? {
            return Err(DispatchError::Internal(format!(
                "action log `{}` was missing or already terminal",
                log.id
            )));
        }

        let response = self.state_machine.response_for(log);
        let error_kind = last_failure(&log.metadata).map(|failure| failure.kind);

        if let Some(reservation) = reservation {
            if let Err(guard_error) = self.guard.finalize(reservation, &response).await {
                error!(
                    event_name = "dispatch.guard.finalize_failed",
                    correlation_id = %correlation_id,
                    action_id = %log.id,
                    idempotency_key = %reservation.key,
                    error = %guard_error,
                    "idempotency reservation could not be finalized"
                );
                return Err(guard_error.into());
            }
        }

        info!(
            event_name = "dispatch.action.completed",
            correlation_id = %correlation_id,
            tenant_id = %log.tenant_id.0,
            action_id = %log.id,
            status = %log.status,
            attempts = log.attempt_count,
            latency_ms = ?log.latency_ms,
            "action reached terminal status"
        );

        Ok(DispatchOutcome {
            action_id: log.id.clone(),
            status: log.status,
            attempts: log.attempt_count,
            error_kind: if log.status == ActionStatus::Success { None } else { error_kind },
            replayed: false,
            response,
        })
    }
}

//! Action lifecycle state machine.
//!
//! Owns every status transition an [`ActionLog`] goes through, the retry
//! backoff schedule, and the response body cached against an idempotency key
//! once a log reaches a terminal status.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::domain::action::{ActionLog, ActionLogId, ActionMetadata, ActionStatus, ActionType};
use crate::domain::idempotency::{CachedResponse, IdempotencyKey};
use crate::domain::tenant::TenantId;
use crate::errors::{ActionFailure, ConfigurationError, ErrorKind};
use crate::providers::{ProviderError, ProviderErrorKind, ProviderResult};

/// Retry and timeout knobs applied to every provider invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// `min(base * 2^(attempt - 1), max)` for the attempt that just failed.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1_u32 << exponent);
        delay.min(self.max_delay)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid action transition from {from} to {to}")]
    InvalidTransition { from: ActionStatus, to: ActionStatus },
}

/// What the dispatcher does after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextStep {
    RetryAfter(Duration),
    Terminal,
}

#[derive(Clone, Debug, Default)]
pub struct ActionStateMachine {
    policy: RetryPolicy,
}

impl ActionStateMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fresh `PENDING` log for an action that passed validation and the guard.
    pub fn new_log(
        &self,
        tenant_id: TenantId,
        action_type: ActionType,
        idempotency_key: Option<IdempotencyKey>,
    ) -> ActionLog {
        let now = Utc::now();
        ActionLog {
            id: ActionLogId(Uuid::new_v4().to_string()),
            tenant_id,
            action_type,
            status: ActionStatus::Pending,
            attempt_count: 0,
            latency_ms: None,
            idempotency_key,
            metadata: ActionMetadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Terminal `FAILURE` log for a payload rejected before any provider work.
    pub fn validation_failure_log(
        &self,
        tenant_id: TenantId,
        action_type: ActionType,
        idempotency_key: Option<IdempotencyKey>,
        message: impl Into<String>,
    ) -> ActionLog {
        let mut log = self.new_log(tenant_id, action_type, idempotency_key);
        let failure = ActionFailure::new(ErrorKind::Validation, "invalid_payload", message);
        record_failure(&mut log.metadata, &failure);
        log.status = ActionStatus::Failure;
        log
    }

    /// Log written for a request answered from the idempotency cache.
    pub fn replayed_log(
        &self,
        tenant_id: TenantId,
        action_type: ActionType,
        idempotency_key: IdempotencyKey,
        cached: &CachedResponse,
    ) -> ActionLog {
        let mut log = self.new_log(tenant_id, action_type, Some(idempotency_key));
        log.status = cached.terminal_status();
        log.metadata.insert("replayed".to_string(), Value::Bool(true));
        if let Some(original) = cached.body.get("action_id") {
            log.metadata.insert("original_action_id".to_string(), original.clone());
        }
        if let Some(external_id) = cached.body.pointer("/result/external_id") {
            log.metadata.insert("external_id".to_string(), external_id.clone());
        }
        log
    }

    /// Starts the next provider attempt and returns its 1-based number.
    pub fn begin_attempt(&self, log: &mut ActionLog) -> Result<u32, TransitionError> {
        if log.status.is_terminal() {
            return Err(TransitionError::InvalidTransition { from: log.status, to: log.status });
        }
        log.attempt_count += 1;
        log.updated_at = Utc::now();
        Ok(log.attempt_count)
    }

    pub fn on_success(
        &self,
        log: &mut ActionLog,
        provider: &str,
        result: ProviderResult,
        latency_ms: u64,
    ) -> Result<(), TransitionError> {
        self.transition(log, ActionStatus::Success)?;
        log.latency_ms = Some(latency_ms);
        log.metadata.insert("provider".to_string(), json!(provider));
        log.metadata.insert("external_id".to_string(), json!(result.external_id));
        log.metadata.insert("raw_response".to_string(), result.raw_response);
        log.metadata.remove("next_retry_in_ms");
        Ok(())
    }

    /// Classifies a provider error: transient errors retry while attempts
    /// remain, provider-side timeouts end in `TIMEOUT`, everything else ends
    /// the action in `FAILURE`.
    pub fn on_provider_error(
        &self,
        log: &mut ActionLog,
        provider: &str,
        error: &ProviderError,
        latency_ms: u64,
    ) -> Result<NextStep, TransitionError> {
        log.metadata.insert("provider".to_string(), json!(provider));
        record_failure(&mut log.metadata, &ActionFailure::from(error));

        if error.is_transient() && log.attempt_count < self.policy.max_attempts() {
            let delay = self.policy.backoff_delay(log.attempt_count);
            self.transition(log, ActionStatus::Retry)?;
            log.metadata.insert("next_retry_in_ms".to_string(), json!(millis(delay)));
            return Ok(NextStep::RetryAfter(delay));
        }

        let terminal = match error.kind {
            ProviderErrorKind::Timeout => ActionStatus::Timeout,
            ProviderErrorKind::Transient | ProviderErrorKind::Permanent => ActionStatus::Failure,
        };
        self.transition(log, terminal)?;
        log.latency_ms = Some(latency_ms);
        log.metadata.remove("next_retry_in_ms");
        Ok(NextStep::Terminal)
    }

    pub fn on_timeout(
        &self,
        log: &mut ActionLog,
        provider: &str,
        latency_ms: u64,
    ) -> Result<(), TransitionError> {
        let failure = ActionFailure::new(
            ErrorKind::Timeout,
            "attempt_timeout",
            format!(
                "provider `{provider}` did not answer within {}ms",
                millis(self.policy.attempt_timeout)
            ),
        );
        self.transition(log, ActionStatus::Timeout)?;
        log.latency_ms = Some(latency_ms);
        log.metadata.insert("provider".to_string(), json!(provider));
        log.metadata.remove("next_retry_in_ms");
        record_failure(&mut log.metadata, &failure);
        Ok(())
    }

    pub fn on_configuration_error(
        &self,
        log: &mut ActionLog,
        error: &ConfigurationError,
    ) -> Result<(), TransitionError> {
        self.transition(log, ActionStatus::Failure)?;
        record_failure(&mut log.metadata, &ActionFailure::from(error));
        Ok(())
    }

    /// Marks an action failed for reasons outside the provider, such as a
    /// panicked dispatch task.
    pub fn on_internal_error(
        &self,
        log: &mut ActionLog,
        message: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.transition(log, ActionStatus::Failure)?;
        record_failure(
            &mut log.metadata,
            &ActionFailure::new(ErrorKind::Internal, "internal_error", message),
        );
        Ok(())
    }

    /// Response body cached and returned for a terminal log.
    pub fn response_for(&self, log: &ActionLog) -> CachedResponse {
        let mut body = json!({
            "action_id": log.id.0,
            "action_type": log.action_type.as_str(),
            "status": log.status.as_str(),
            "attempts": log.attempt_count,
        });

        let status_code = match (log.status, last_failure(&log.metadata)) {
            (ActionStatus::Success, _) => {
                body["result"] = json!({
                    "external_id": log.metadata.get("external_id").cloned().unwrap_or(Value::Null),
                    "provider": log.metadata.get("provider").cloned().unwrap_or(Value::Null),
                    "raw_response":
                        log.metadata.get("raw_response").cloned().unwrap_or(Value::Null),
                });
                200
            }
            (_, Some(failure)) => {
                let code = failure.kind.status_code();
                body["error"] = json!({
                    "kind": failure.kind.as_str(),
                    "code": failure.code,
                    "message": failure.message,
                });
                code
            }
            (ActionStatus::Timeout, None) => ErrorKind::Timeout.status_code(),
            (_, None) => ErrorKind::Internal.status_code(),
        };

        CachedResponse { status_code, body }
    }

    fn transition(&self, log: &mut ActionLog, to: ActionStatus) -> Result<(), TransitionError> {
        validate_transition(log.status, to)?;
        log.status = to;
        log.updated_at = Utc::now();
        Ok(())
    }
}

/// `PENDING` and `RETRY` may move to `RETRY` or any terminal status; terminal
/// statuses never move again.
pub fn validate_transition(from: ActionStatus, to: ActionStatus) -> Result<(), TransitionError> {
    let valid = match (from, to) {
        (ActionStatus::Pending | ActionStatus::Retry, ActionStatus::Pending) => false,
        (ActionStatus::Pending | ActionStatus::Retry, _) => true,
        (ActionStatus::Success | ActionStatus::Failure | ActionStatus::Timeout, _) => false,
    };

    if valid {
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition { from, to })
    }
}

/// Last error recorded on a log, if any.
pub fn last_failure(metadata: &ActionMetadata) -> Option<ActionFailure> {
    metadata.get("last_error").cloned().and_then(|value| serde_json::from_value(value).ok())
}

fn record_failure(metadata: &mut ActionMetadata, failure: &ActionFailure) {
    metadata.insert("error_kind".to_string(), json!(failure.kind.as_str()));
    metadata.insert(
        "last_error".to_string(),
        serde_json::to_value(failure).unwrap_or_else(|_| json!({"message": failure.message})),
    );
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

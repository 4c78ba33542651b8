use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::action::ActionStatus;
use crate::domain::tenant::TenantId;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    /// Returns `None` for blank, oversized, or non-printable keys.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let valid = !trimmed.is_empty()
            && trimmed.len() <= MAX_IDEMPOTENCY_KEY_LEN
            && trimmed.chars().all(|ch| ch.is_ascii_graphic());
        valid.then(|| Self(trimmed.to_string()))
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyRecordId(pub String);

/// Response cached against an idempotency key once the action is terminal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status_code: u16,
    pub body: Value,
}

impl CachedResponse {
    /// Terminal status the response was produced for.
    ///
    /// Bodies written by the dispatcher carry a `status` field; anything else
    /// falls back to the status code class.
    pub fn terminal_status(&self) -> ActionStatus {
        let declared =
            self.body.get("status").and_then(Value::as_str).and_then(ActionStatus::parse);
        match declared {
            Some(status) if status.is_terminal() => status,
            _ if (200..300).contains(&self.status_code) => ActionStatus::Success,
            _ if self.status_code == 504 => ActionStatus::Timeout,
            _ => ActionStatus::Failure,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: IdempotencyRecordId,
    pub tenant_id: TenantId,
    pub idempotency_key: IdempotencyKey,
    pub request_method: String,
    pub request_path: String,
    pub request_body_hash: String,
    pub response: Option<CachedResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_finalized(&self) -> bool {
        self.response.is_some()
    }

    pub fn matches_request(&self, method: &str, path: &str, body_hash: &str) -> bool {
        self.request_body_hash == body_hash
            && self.request_method.eq_ignore_ascii_case(method)
            && self.request_path == path
    }
}

/// Rebuilds `value` with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, nested) in entries {
                sorted.insert(key.clone(), canonicalize(nested));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 hex digest of the compact canonical JSON encoding of `body`.
pub fn hash_request_body(body: &Value) -> String {
    use sha2::{Digest, Sha256};
    let canonical = canonicalize(body).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use courier_core::domain::action::{
    ActionLog, ActionLogId, ActionPayload, ActionStatus, ActionType, ProviderCategory,
};
use courier_core::domain::idempotency::IdempotencyKey;
use courier_core::domain::tenant::{hash_api_key, ProviderConfig, Tenant, TenantId};
use courier_core::errors::ErrorKind;
use courier_core::providers::sandbox::register_sandbox;
use courier_core::providers::{
    CrmProvider, ProviderError, ProviderHandle, ProviderRegistry, ProviderResult,
};
use courier_core::state_machine::{ActionStateMachine, RetryPolicy};
use courier_db::repositories::{
    ActionLogRepository, ActionStats, IdempotencyRepository, RepositoryError,
    SqlActionLogRepository, SqlIdempotencyRepository, SqlLeaseRepository, SqlTenantRepository,
    TenantRepository,
};
use courier_db::{connect_with_settings, migrations, DbPool, DemoSeedDataset};
use courier_dispatch::{
    ActionDispatcher, ActionRequest, DispatchError, ExpirySweeper, GuardSettings,
    IdempotencyGuard, SweeperSettings,
};

#[derive(Clone, Copy, Debug)]
enum Step {
    Succeed,
    Transient,
    Permanent,
}

struct StubCrm {
    calls: Arc<AtomicUsize>,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
}

impl StubCrm {
    fn next_step(&self) -> Step {
        self.script.lock().expect("script lock").pop_front().unwrap_or(self.fallback)
    }

    async fn respond(&self, payload: &ActionPayload) -> Result<ProviderResult, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        match self.next_step() {
            Step::Succeed => Ok(ProviderResult {
                external_id: format!("stub-{call}"),
                raw_response: json!({"echo": Value::Object(payload.clone())}),
            }),
            Step::Transient => Err(ProviderError::transient("rate_limited", "slow down")),
            Step::Permanent => Err(ProviderError::permanent("unauthorized", "bad credentials")),
        }
    }
}

#[async_trait]
impl CrmProvider for StubCrm {
    fn name(&self) -> &str {
        "stub"
    }

    async fn create_record(
        &self,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        self.respond(payload).await
    }

    async fn update_record(
        &self,
        payload: &ActionPayload,
    ) -> Result<ProviderResult, ProviderError> {
        self.respond(payload).await
    }

    async fn find_record(
        &self,
        _query: &ActionPayload,
    ) -> Result<Option<ProviderResult>, ProviderError> {
        Ok(None)
    }
}

struct StubPlan {
    script: Vec<Step>,
    fallback: Step,
    delay: Duration,
}

impl StubPlan {
    fn always(step: Step) -> Self {
        Self { script: Vec::new(), fallback: step, delay: Duration::ZERO }
    }
}

struct Harness {
    pool: DbPool,
    dispatcher: ActionDispatcher,
    action_logs: Arc<SqlActionLogRepository>,
    idempotency: Arc<SqlIdempotencyRepository>,
    calls: Arc<AtomicUsize>,
}

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        attempt_timeout: Duration::from_secs(2),
    }
}

fn guard_settings() -> GuardSettings {
    GuardSettings {
        ttl: chrono::Duration::hours(24),
        wait_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(5),
    }
}

async fn harness(plan: StubPlan, policy: RetryPolicy, guard: GuardSettings) -> Harness {
    harness_with_logs(plan, policy, guard, |logs| logs).await
}

/// Like [`harness`], but lets a test wrap the action log store the dispatcher writes to.
async fn harness_with_logs(
    plan: StubPlan,
    policy: RetryPolicy,
    guard: GuardSettings,
    wrap_logs: impl FnOnce(Arc<dyn ActionLogRepository>) -> Arc<dyn ActionLogRepository>,
) -> Harness {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
    migrations::run_pending(&pool).await.expect("run migrations");

    let calls = Arc::new(AtomicUsize::new(0));
    let stub = Arc::new(StubCrm {
        calls: calls.clone(),
        script: Mutex::new(plan.script.into_iter().collect()),
        fallback: plan.fallback,
        delay: plan.delay,
    });

    let mut registry = ProviderRegistry::new();
    register_sandbox(&mut registry).expect("register sandbox");
    registry
        .register(ProviderCategory::Crm, "stub", move |_settings| {
            Ok(ProviderHandle::Crm(stub.clone()))
        })
        .expect("register stub");

    let tenants = SqlTenantRepository::new(pool.clone());
    tenants.save(tenant("t1", "stub")).await.expect("save t1");
    tenants.save(tenant("t2", "sandbox")).await.expect("save t2");

    let action_logs = Arc::new(SqlActionLogRepository::new(pool.clone()));
    let idempotency = Arc::new(SqlIdempotencyRepository::new(pool.clone()));
    let dispatcher = ActionDispatcher::new(
        registry,
        IdempotencyGuard::new(idempotency.clone(), guard),
        wrap_logs(action_logs.clone() as Arc<dyn ActionLogRepository>),
        ActionStateMachine::new(policy),
    );

    Harness { pool, dispatcher, action_logs, idempotency, calls }
}

/// Tenant routing CRM to `crm_provider` and email to the sandbox. No helpdesk.
fn tenant(id: &str, crm_provider: &str) -> Tenant {
    let now = Utc::now();
    let mut provider_configs = std::collections::BTreeMap::new();
    provider_configs.insert(ProviderCategory::Crm, ProviderConfig::named(crm_provider));
    provider_configs.insert(ProviderCategory::Email, ProviderConfig::named("sandbox"));
    Tenant {
        id: TenantId(id.to_string()),
        slug: format!("{id}-slug"),
        api_key_hash: hash_api_key(&format!("ck_{id}")),
        provider_configs,
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

fn key(value: &str) -> IdempotencyKey {
    IdempotencyKey(value.to_string())
}

fn crm_create(tenant_id: &str, body: Value) -> ActionRequest {
    ActionRequest::new(tenant(tenant_id, "stub"), ActionType::CrmCreate, body)
}

#[tokio::test]
async fn concurrent_identical_requests_invoke_provider_once() {
    let plan =
        StubPlan { script: Vec::new(), fallback: Step::Succeed, delay: Duration::from_millis(50) };
    let h = harness(plan, fast_policy(0), guard_settings()).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let dispatcher = h.dispatcher.clone();
        handles.push(tokio::spawn(async move {
            dispatcher
                .dispatch(
                    crm_create("t1", json!({"email": "a@b.com"})).with_idempotency_key(key("k-1")),
                )
                .await
        }));
    }

    let mut responses = Vec::new();
    let mut fresh = 0;
    for handle in handles {
        let outcome = handle.await.expect("task joins").expect("dispatch succeeds");
        assert_eq!(outcome.status, ActionStatus::Success);
        if !outcome.replayed {
            fresh += 1;
        }
        responses.push(outcome.response);
    }

    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fresh, 1);
    assert!(responses.windows(2).all(|pair| pair[0] == pair[1]));

    let logs = h
        .action_logs
        .list_for_idempotency_key(&TenantId("t1".to_string()), &key("k-1"))
        .await
        .expect("list logs");
    assert_eq!(logs.len(), 8);
    assert!(logs.iter().all(|log| log.status.is_terminal()));

    h.pool.close().await;
}

#[tokio::test]
async fn reused_key_with_different_body_conflicts_without_provider_call() {
    let h = harness(StubPlan::always(Step::Succeed), fast_policy(0), guard_settings()).await;

    h.dispatcher
        .dispatch(crm_create("t1", json!({"email": "a@b.com"})).with_idempotency_key(key("k-2")))
        .await
        .expect("first dispatch");

    let error = h
        .dispatcher
        .dispatch(crm_create("t1", json!({"email": "c@d.com"})).with_idempotency_key(key("k-2")))
        .await
        .expect_err("conflict");
    assert!(matches!(error, DispatchError::Conflict { .. }));
    assert_eq!(error.kind(), ErrorKind::Conflict);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);

    let logs = h
        .action_logs
        .list_for_idempotency_key(&TenantId("t1".to_string()), &key("k-2"))
        .await
        .expect("list logs");
    assert_eq!(logs.len(), 1);

    h.pool.close().await;
}

#[tokio::test]
async fn same_key_is_scoped_per_tenant() {
    let h = harness(StubPlan::always(Step::Succeed), fast_policy(0), guard_settings()).await;

    let first = h
        .dispatcher
        .dispatch(crm_create("t1", json!({"email": "a@b.com"})).with_idempotency_key(key("shared")))
        .await
        .expect("t1 dispatch");
    let second = h
        .dispatcher
        .dispatch(
            ActionRequest::new(
                tenant("t2", "sandbox"),
                ActionType::CrmCreate,
                json!({"email": "x@y.com"}),
            )
            .with_idempotency_key(key("shared")),
        )
        .await
        .expect("t2 dispatch");

    assert!(!first.replayed && !second.replayed);
    assert_ne!(first.action_id, second.action_id);

    h.pool.close().await;
}

#[tokio::test]
async fn expired_record_is_invisible_then_swept() {
    let expiring = GuardSettings { ttl: chrono::Duration::milliseconds(-1), ..guard_settings() };
    let h = harness(StubPlan::always(Step::Succeed), fast_policy(0), expiring).await;
    let tenant_id = TenantId("t1".to_string());

    h.dispatcher
        .dispatch(crm_create("t1", json!({"email": "a@b.com"})).with_idempotency_key(key("k-3")))
        .await
        .expect("first dispatch");

    assert_eq!(h.dispatcher.guard().lookup(&tenant_id, &key("k-3")).await.expect("lookup"), None);
    assert!(h.idempotency.find(&tenant_id, &key("k-3")).await.expect("find").is_some());

    let sweeper = ExpirySweeper::new(
        h.idempotency.clone(),
        Arc::new(SqlLeaseRepository::new(h.pool.clone())),
        SweeperSettings::default(),
    );
    let report = sweeper.run_once(Utc::now()).await.expect("sweep");
    assert!(report.leader);
    assert_eq!(report.deleted, 1);
    assert_eq!(h.idempotency.find(&tenant_id, &key("k-3")).await.expect("find after sweep"), None);

    let again = h
        .dispatcher
        .dispatch(crm_create("t1", json!({"email": "a@b.com"})).with_idempotency_key(key("k-3")))
        .await
        .expect("dispatch after expiry");
    assert!(!again.replayed);
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);

    h.pool.close().await;
}

#[tokio::test]
async fn always_transient_provider_is_attempted_max_retries_plus_one() {
    let h = harness(StubPlan::always(Step::Transient), fast_policy(2), guard_settings()).await;

    let outcome = h
        .dispatcher
        .dispatch(crm_create("t1", json!({"email": "a@b.com"})))
        .await
        .expect("dispatch completes");

    assert_eq!(h.calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.status, ActionStatus::Failure);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.error_kind, Some(ErrorKind::ProviderTransient));
    assert_eq!(outcome.response.status_code, 502);

    let stored = h.action_logs.find_by_id(&outcome.action_id).await.expect("find").expect("stored");
    assert_eq!(stored.status, ActionStatus::Failure);
    assert_eq!(stored.metadata.get("error_kind"), Some(&json!("provider_transient")));
    assert!(stored.latency_ms.is_some());

    h.pool.close().await;
}

#[tokio::test]
async fn transient_failure_then_success_retries_once() {
    let plan =
        StubPlan { script: vec![Step::Transient], fallback: Step::Succeed, delay: Duration::ZERO };
    let h = harness(plan, fast_policy(3), guard_settings()).await;

    let outcome = h
        .dispatcher
        .dispatch(crm_create("t1", json!({"email": "a@b.com"})))
        .await
        .expect("dispatch completes");

    assert_eq!(outcome.status, ActionStatus::Success);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.error_kind, None);
    assert_eq!(outcome.response.body["result"]["external_id"], json!("stub-2"));

    h.pool.close().await;
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let h = harness(StubPlan::always(Step::Permanent), fast_policy(3), guard_settings()).await;

    let outcome = h
        .dispatcher
        .dispatch(crm_create("t1", json!({"email": "a@b.com"})).with_idempotency_key(key("k-4")))
        .await
        .expect("dispatch completes");

    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.status, ActionStatus::Failure);
    assert_eq!(outcome.error_kind, Some(ErrorKind::ProviderPermanent));
    assert_eq!(outcome.response.status_code, 422);

    let replay = h
        .dispatcher
        .dispatch(crm_create("t1", json!({"email": "a@b.com"})).with_idempotency_key(key("k-4")))
        .await
        .expect("replay");
    assert!(replay.replayed);
    assert_eq!(replay.status, ActionStatus::Failure);
    assert_eq!(replay.response, outcome.response);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);

    h.pool.close().await;
}

#[tokio::test]
async fn slow_provider_times_out_without_retry() {
    let plan =
        StubPlan { script: Vec::new(), fallback: Step::Succeed, delay: Duration::from_millis(500) };
    let policy = RetryPolicy { attempt_timeout: Duration::from_millis(20), ..fast_policy(3) };
    let h = harness(plan, policy, guard_settings()).await;

    let outcome = h
        .dispatcher
        .dispatch(crm_create("t1", json!({"email": "a@b.com"})))
        .await
        .expect("dispatch completes");

    assert_eq!(outcome.status, ActionStatus::Timeout);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(outcome.response.status_code, 504);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);

    h.pool.close().await;
}

#[tokio::test]
async fn keyed_timeout_replays_cached_timeout_without_second_call() {
    let plan =
        StubPlan { script: Vec::new(), fallback: Step::Succeed, delay: Duration::from_millis(500) };
    let policy = RetryPolicy { attempt_timeout: Duration::from_millis(20), ..fast_policy(3) };
    let h = harness(plan, policy, guard_settings()).await;
    let request =
        || crm_create("t1", json!({"email": "a@b.com"})).with_idempotency_key(key("k-slow"));

    let first = h.dispatcher.dispatch(request()).await.expect("first dispatch");
    assert_eq!(first.status, ActionStatus::Timeout);
    assert_eq!(first.response.status_code, 504);
    assert_eq!(first.response.body["error"]["kind"], json!("timeout"));

    let retry = h.dispatcher.dispatch(request()).await.expect("explicit retry");
    assert!(retry.replayed);
    assert_eq!(retry.status, ActionStatus::Timeout);
    assert_eq!(retry.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(retry.response, first.response);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);

    h.pool.close().await;
}

#[tokio::test]
async fn dropped_caller_still_reaches_terminal_state_and_finalizes_key() {
    let plan =
        StubPlan { script: Vec::new(), fallback: Step::Succeed, delay: Duration::from_millis(100) };
    let h = harness(plan, fast_policy(0), guard_settings()).await;
    let tenant_id = TenantId("t1".to_string());

    let dispatcher = h.dispatcher.clone();
    let caller = tokio::spawn(async move {
        dispatcher
            .dispatch(
                crm_create("t1", json!({"email": "a@b.com"})).with_idempotency_key(key("k-drop")),
            )
            .await
    });

    for _ in 0..200 {
        if h.calls.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.calls.load(Ordering::SeqCst), 1, "provider call should be in flight");
    caller.abort();
    assert!(caller.await.expect_err("caller was aborted").is_cancelled());

    let mut logs = Vec::new();
    for _ in 0..200 {
        logs = h
            .action_logs
            .list_for_idempotency_key(&tenant_id, &key("k-drop"))
            .await
            .expect("list logs");
        if logs.iter().any(|log| log.status.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, ActionStatus::Success);

    let cached = h.dispatcher.guard().lookup(&tenant_id, &key("k-drop")).await.expect("lookup");
    let cached = cached.expect("record").response.expect("finalized response");
    assert_eq!(cached.status_code, 200);

    let replay = h
        .dispatcher
        .dispatch(crm_create("t1", json!({"email": "a@b.com"})).with_idempotency_key(key("k-drop")))
        .await
        .expect("replay");
    assert!(replay.replayed);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);

    h.pool.close().await;
}

/// Action log store whose `update` fails while the action waits for a retry.
struct RetryWriteFails {
    inner: Arc<dyn ActionLogRepository>,
}

#[async_trait]
impl ActionLogRepository for RetryWriteFails {
    async fn insert(&self, log: &ActionLog) -> Result<(), RepositoryError> {
        self.inner.insert(log).await
    }

    async fn update(&self, log: &ActionLog) -> Result<bool, RepositoryError> {
        if log.status == ActionStatus::Retry {
            return Err(RepositoryError::Contention("disk hiccup".to_string()));
        }
        self.inner.update(log).await
    }

    async fn find_by_id(&self, id: &ActionLogId) -> Result<Option<ActionLog>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn list_recent(
        &self,
        tenant_id: &TenantId,
        limit: u32,
    ) -> Result<Vec<ActionLog>, RepositoryError> {
        self.inner.list_recent(tenant_id, limit).await
    }

    async fn list_for_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Vec<ActionLog>, RepositoryError> {
        self.inner.list_for_idempotency_key(tenant_id, key).await
    }

    async fn stats(&self, tenant_id: Option<&TenantId>) -> Result<ActionStats, RepositoryError> {
        self.inner.stats(tenant_id).await
    }
}

#[tokio::test]
async fn storage_error_mid_dispatch_fails_action_and_releases_key() {
    let h = harness_with_logs(
        StubPlan::always(Step::Transient),
        fast_policy(2),
        guard_settings(),
        |inner| Arc::new(RetryWriteFails { inner }),
    )
    .await;
    let tenant_id = TenantId("t1".to_string());
    let request = || crm_create("t1", json!({"email": "a@b.com"})).with_idempotency_key(key("k"));

    let first = h.dispatcher.dispatch(request()).await.expect_err("storage error surfaces");
    assert!(matches!(first, DispatchError::Internal(_)));
    assert_eq!(first.kind(), ErrorKind::Internal);
    assert!(first.to_string().contains("disk hiccup"));

    let logs = h.action_logs.list_for_idempotency_key(&tenant_id, &key("k")).await.expect("list");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, ActionStatus::Failure);
    assert_eq!(logs[0].metadata.get("error_kind"), Some(&json!("internal")));

    let second = h.dispatcher.dispatch(request()).await.expect("key is not left in flight");
    assert!(second.replayed);
    assert_eq!(second.status, ActionStatus::Failure);
    assert_eq!(second.error_kind, Some(ErrorKind::Internal));
    assert_eq!(second.response.status_code, 500);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);

    h.pool.close().await;
}

#[tokio::test]
async fn missing_category_fails_only_that_category() {
    let h = harness(StubPlan::always(Step::Succeed), fast_policy(3), guard_settings()).await;

    let helpdesk = h
        .dispatcher
        .dispatch(
            ActionRequest::new(
                tenant("t1", "stub"),
                ActionType::HelpdeskCreateTicket,
                json!({"subject": "Printer on fire"}),
            )
            .with_idempotency_key(key("k-5")),
        )
        .await
        .expect("dispatch completes");
    assert_eq!(helpdesk.status, ActionStatus::Failure);
    assert_eq!(helpdesk.attempts, 0);
    assert_eq!(helpdesk.error_kind, Some(ErrorKind::Configuration));
    assert_eq!(helpdesk.response.status_code, 422);

    let email = h
        .dispatcher
        .dispatch(ActionRequest::new(
            tenant("t1", "stub"),
            ActionType::EmailSend,
            json!({"to": "a@b.com", "subject": "hi"}),
        ))
        .await
        .expect("email dispatch");
    assert_eq!(email.status, ActionStatus::Success);
    assert_eq!(email.response.body["result"]["provider"], json!("sandbox"));

    let unknown = h
        .dispatcher
        .dispatch(ActionRequest::new(
            tenant("t1", "salesforce"),
            ActionType::CrmCreate,
            json!({"email": "a@b.com"}),
        ))
        .await
        .expect("crm dispatch");
    assert_eq!(unknown.error_kind, Some(ErrorKind::Configuration));
    assert_eq!(unknown.response.body["error"]["code"], json!("provider_unknown"));
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    h.pool.close().await;
}

#[tokio::test]
async fn invalid_payload_is_logged_and_never_reserves_the_key() {
    let h = harness(StubPlan::always(Step::Succeed), fast_policy(0), guard_settings()).await;
    let tenant_id = TenantId("t1".to_string());

    let error = h
        .dispatcher
        .dispatch(
            ActionRequest::new(
                tenant("t1", "stub"),
                ActionType::CrmUpdate,
                json!({"email": "a@b.com"}),
            )
            .with_idempotency_key(key("k-6")),
        )
        .await
        .expect_err("validation error");

    let DispatchError::Validation { action_id, response, .. } = error else {
        panic!("expected validation error");
    };
    assert_eq!(response.status_code, 400);
    let stored = h.action_logs.find_by_id(&action_id).await.expect("find").expect("stored");
    assert_eq!(stored.status, ActionStatus::Failure);
    assert_eq!(h.idempotency.find(&tenant_id, &key("k-6")).await.expect("find key"), None);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    h.pool.close().await;
}

#[tokio::test]
async fn seeded_tenant_replays_cached_success_and_rejects_changed_body() {
    let h = harness(StubPlan::always(Step::Succeed), fast_policy(0), guard_settings()).await;
    DemoSeedDataset::load(&h.pool).await.expect("seed demo tenants");
    let t1 = SqlTenantRepository::new(h.pool.clone())
        .find_by_api_key_hash(&hash_api_key("ck_demo_t1"))
        .await
        .expect("lookup t1")
        .expect("t1 seeded");

    let request = || {
        ActionRequest::new(t1.clone(), ActionType::CrmCreate, json!({"email": "a@b.com"}))
            .with_idempotency_key(key("abc123"))
    };

    let first = h.dispatcher.dispatch(request()).await.expect("first dispatch");
    assert_eq!(first.status, ActionStatus::Success);
    assert!(!first.replayed);
    let external_id = first.response.body["result"]["external_id"].as_str().expect("external id");
    assert!(external_id.starts_with("sbx_crm_"));

    let replay = h.dispatcher.dispatch(request()).await.expect("replay");
    assert!(replay.replayed);
    assert_eq!(replay.response, first.response);

    let conflict = h
        .dispatcher
        .dispatch(
            ActionRequest::new(t1.clone(), ActionType::CrmCreate, json!({"email": "c@d.com"}))
                .with_idempotency_key(key("abc123")),
        )
        .await
        .expect_err("conflict");
    assert!(matches!(conflict, DispatchError::Conflict { .. }));

    let logs = h.action_logs.list_for_idempotency_key(&t1.id, &key("abc123")).await.expect("logs");
    assert_eq!(logs.len(), 2);
    let replayed: Vec<bool> = logs
        .iter()
        .map(|log| log.metadata.get("replayed").and_then(Value::as_bool).unwrap_or(false))
        .collect();
    assert_eq!(replayed.iter().filter(|flag| **flag).count(), 1);

    let stats = h.action_logs.stats(Some(&t1.id)).await.expect("stats");
    assert_eq!(stats.by_status.get("SUCCESS"), Some(&2));

    h.pool.close().await;
}

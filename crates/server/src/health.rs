use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use courier_core::providers::RegistryStatus;
use courier_db::DbPool;
use serde::Serialize;
use tracing::error;

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: DbPool,
    pub providers: RegistryStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub providers: RegistryStatus,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "courier-server runtime initialized".to_string(),
        },
        database,
        providers: state.providers.clone(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(db_error) => {
            error!(
                event_name = "system.health.database_failed",
                correlation_id = "health",
                error = %db_error,
                "health check database query failed"
            );
            HealthCheck { status: "degraded", detail: format!("database query failed: {db_error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, http::StatusCode, Json};
    use courier_core::providers::sandbox::register_sandbox;
    use courier_core::providers::ProviderRegistry;
    use courier_db::connect_with_settings;

    use crate::health::{health, HealthState};

    fn sandbox_status() -> courier_core::providers::RegistryStatus {
        let mut registry = ProviderRegistry::new();
        register_sandbox(&mut registry).expect("register sandbox");
        registry.status()
    }

    #[tokio::test]
    async fn health_returns_ready_when_database_is_reachable() {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool.clone(), providers: sandbox_status() })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.providers.total_providers, 5);

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        pool.close().await;

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool, providers: sandbox_status() })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }
}

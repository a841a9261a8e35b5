use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tracing::warn;
use waypoint_db::DbPool;

/// Undelivered notifications above this count mark the outbox as lagging.
pub const OUTBOX_BACKLOG_WARN: i64 = 1_000;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
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
    pub outbox: HealthCheck,
    pub checked_at: String,
}

/// Readiness probe. Answers 503 while the database is unreachable; a lagging
/// outbox is reported but does not fail readiness.
pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";
    let outbox = if ready {
        outbox_check(&state.db_pool).await
    } else {
        HealthCheck { status: "unknown", detail: "database unavailable".to_string() }
    };

    if !ready {
        warn!(
            event_name = "system.health.degraded",
            correlation_id = "health",
            detail = %database.detail,
            "readiness probe failed"
        );
    }

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "waypoint-server runtime initialized".to_string(),
        },
        database,
        outbox,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

async fn outbox_check(pool: &DbPool) -> HealthCheck {
    let pending = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM notification_outbox WHERE delivered_at IS NULL",
    )
    .fetch_one(pool)
    .await;

    match pending {
        Ok(count) if count > OUTBOX_BACKLOG_WARN => HealthCheck {
            status: "lagging",
            detail: format!("{count} notifications awaiting delivery"),
        },
        Ok(count) => {
            HealthCheck { status: "ready", detail: format!("{count} notifications awaiting delivery") }
        }
        Err(error) => {
            HealthCheck { status: "unknown", detail: format!("outbox query failed: {error}") }
        }
    }
}

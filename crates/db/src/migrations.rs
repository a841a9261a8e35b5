use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub const BASELINE_TABLES: [&str; 4] =
    ["travel_request", "audit_log", "booking_attempt", "notification_outbox"];

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Baseline tables absent from the connected database, in declaration order.
pub async fn missing_tables(pool: &DbPool) -> Result<Vec<&'static str>, sqlx::Error> {
    let mut missing = Vec::new();
    for table in BASELINE_TABLES {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(pool)
        .await?;
        if exists == 0 {
            missing.push(table);
        }
    }
    Ok(missing)
}

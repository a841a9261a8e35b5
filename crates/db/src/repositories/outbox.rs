use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row};

use waypoint_core::notify::{DomainEvent, NotificationError, NotificationSink, PublishOutcome};

use super::{format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

/// Durable notification sink. Events land in `notification_outbox` and are
/// drained by a relay; the unique dedupe key collapses repeated publishes.
#[derive(Clone)]
pub struct SqlOutboxSink {
    pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutboxRecord {
    pub seq: i64,
    pub event: DomainEvent,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl SqlOutboxSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Undelivered events, oldest first.
    pub async fn pending(&self, limit: u32) -> Result<Vec<OutboxRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT seq, payload_json, delivered_at
             FROM notification_outbox
             WHERE delivered_at IS NULL
             ORDER BY seq ASC
             LIMIT ?",
        )
        .bind(i64::from(limit.max(1)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    pub async fn mark_delivered(
        &self,
        seq: i64,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE notification_outbox SET delivered_at = ?
             WHERE seq = ? AND delivered_at IS NULL",
        )
        .bind(format_timestamp(&delivered_at))
        .bind(seq)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn enqueue(&self, event: &DomainEvent) -> Result<PublishOutcome, RepositoryError> {
        let payload_json =
            serde_json::to_string(event).map_err(|error| RepositoryError::Encode(error.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO notification_outbox (
                dedupe_key,
                kind,
                entity_id,
                tenant_id,
                correlation_id,
                payload_json,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(dedupe_key) DO NOTHING",
        )
        .bind(&event.dedupe_key)
        .bind(event.kind.as_str())
        .bind(&event.entity_id)
        .bind(event.tenant_id.as_ref().map(|tenant| tenant.0.as_str()))
        .bind(&event.correlation_id)
        .bind(&payload_json)
        .bind(format_timestamp(&event.occurred_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(PublishOutcome::Published)
        } else {
            Ok(PublishOutcome::Duplicate)
        }
    }
}

#[async_trait]
impl NotificationSink for SqlOutboxSink {
    async fn publish(&self, event: DomainEvent) -> Result<PublishOutcome, NotificationError> {
        self.enqueue(&event).await.map_err(|error| NotificationError::Delivery(error.to_string()))
    }
}

fn record_from_row(row: SqliteRow) -> Result<OutboxRecord, RepositoryError> {
    let payload_raw = row.try_get::<String, _>("payload_json")?;
    let event = serde_json::from_str::<DomainEvent>(&payload_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid outbox payload ({error})")))?;

    Ok(OutboxRecord {
        seq: row.try_get("seq")?,
        event,
        delivered_at: row
            .try_get::<Option<String>, _>("delivered_at")?
            .map(|value| parse_timestamp("delivered_at", value))
            .transpose()?,
    })
}

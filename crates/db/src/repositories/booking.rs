use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use waypoint_core::domain::actor::{ActorId, CompanyId};
use waypoint_core::domain::booking::{AttemptResult, BookingAttempt, BookingKind, IdempotencyKey};
use waypoint_core::domain::request::RequestId;
use waypoint_core::errors::StoreError;
use waypoint_core::store::{BookingStore, ClaimOutcome};

use super::{format_timestamp, parse_timestamp, parse_u32, RepositoryError};
use crate::DbPool;

const ATTEMPT_COLUMNS: &str = "idempotency_key,
    kind,
    offer_id,
    provider,
    request_id,
    company_id,
    traveler_ids_json,
    approval_required,
    approved_by,
    result,
    external_id,
    confirmation_code,
    attempt_count,
    last_error,
    payload_hash,
    created_at,
    updated_at";

pub struct SqlBookingStore {
    pool: DbPool,
}

impl SqlBookingStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert_if_absent(
        &self,
        candidate: &BookingAttempt,
        traveler_ids_json: &str,
    ) -> Result<Option<BookingAttempt>, RepositoryError> {
        let sql = format!(
            "INSERT INTO booking_attempt ({ATTEMPT_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, 1, ?, ?, ?, ?)
             ON CONFLICT(idempotency_key) DO NOTHING
             RETURNING {ATTEMPT_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(candidate.idempotency_key.as_str())
            .bind(candidate.kind.as_str())
            .bind(&candidate.offer_id)
            .bind(&candidate.provider)
            .bind(candidate.request_id.as_ref().map(|id| id.0.as_str()))
            .bind(candidate.company_id.as_ref().map(|id| id.0.as_str()))
            .bind(traveler_ids_json)
            .bind(candidate.approval_required)
            .bind(candidate.approved_by.as_ref().map(|id| id.0.as_str()))
            .bind(&candidate.external_id)
            .bind(&candidate.confirmation_code)
            .bind(&candidate.last_error)
            .bind(&candidate.payload_hash)
            .bind(format_timestamp(&candidate.created_at))
            .bind(format_timestamp(&candidate.updated_at))
            .fetch_optional(&self.pool)
            .await?;

        row.map(attempt_from_row).transpose()
    }

    /// Flips a failed (or abandoned pending) attempt back to pending. The
    /// condition and the write happen in one statement.
    async fn rearm(
        &self,
        candidate: &BookingAttempt,
        traveler_ids_json: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<BookingAttempt>, RepositoryError> {
        let sql = format!(
            "UPDATE booking_attempt SET
                kind = ?,
                offer_id = ?,
                provider = ?,
                request_id = ?,
                company_id = ?,
                traveler_ids_json = ?,
                approval_required = ?,
                approved_by = ?,
                result = 'pending',
                external_id = NULL,
                confirmation_code = NULL,
                attempt_count = attempt_count + 1,
                payload_hash = ?,
                updated_at = ?
             WHERE idempotency_key = ?
               AND (result = 'failed' OR (result = 'pending' AND updated_at < ?))
             RETURNING {ATTEMPT_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(candidate.kind.as_str())
            .bind(&candidate.offer_id)
            .bind(&candidate.provider)
            .bind(candidate.request_id.as_ref().map(|id| id.0.as_str()))
            .bind(candidate.company_id.as_ref().map(|id| id.0.as_str()))
            .bind(traveler_ids_json)
            .bind(candidate.approval_required)
            .bind(candidate.approved_by.as_ref().map(|id| id.0.as_str()))
            .bind(&candidate.payload_hash)
            .bind(format_timestamp(&candidate.updated_at))
            .bind(candidate.idempotency_key.as_str())
            .bind(format_timestamp(&stale_before))
            .fetch_optional(&self.pool)
            .await?;

        row.map(attempt_from_row).transpose()
    }

    async fn fetch(&self, key: &IdempotencyKey) -> Result<Option<BookingAttempt>, RepositoryError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM booking_attempt WHERE idempotency_key = ?"
        );
        let row = sqlx::query(&sql).bind(key.as_str()).fetch_optional(&self.pool).await?;
        row.map(attempt_from_row).transpose()
    }
}

#[async_trait]
impl BookingStore for SqlBookingStore {
    async fn find(&self, key: &IdempotencyKey) -> Result<Option<BookingAttempt>, StoreError> {
        Ok(self.fetch(key).await?)
    }

    async fn claim(
        &self,
        candidate: BookingAttempt,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let traveler_ids_json = serde_json::to_string(&candidate.traveler_ids)
            .map_err(|error| RepositoryError::Encode(error.to_string()))?;

        if let Some(inserted) = self.insert_if_absent(&candidate, &traveler_ids_json).await? {
            return Ok(ClaimOutcome::Claimed(inserted));
        }
        if let Some(rearmed) = self.rearm(&candidate, &traveler_ids_json, stale_before).await? {
            return Ok(ClaimOutcome::Claimed(rearmed));
        }

        match self.fetch(&candidate.idempotency_key).await? {
            Some(existing) => Ok(ClaimOutcome::Existing(existing)),
            None => Err(StoreError::Backend(format!(
                "booking attempt `{}` vanished while claiming",
                candidate.idempotency_key
            ))),
        }
    }

    async fn settle(&self, attempt: BookingAttempt) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE booking_attempt SET
                result = ?,
                external_id = ?,
                confirmation_code = ?,
                last_error = ?,
                approval_required = ?,
                approved_by = ?,
                updated_at = ?
             WHERE idempotency_key = ? AND attempt_count = ? AND result = 'pending'",
        )
        .bind(attempt.result.as_str())
        .bind(&attempt.external_id)
        .bind(&attempt.confirmation_code)
        .bind(&attempt.last_error)
        .bind(attempt.approval_required)
        .bind(attempt.approved_by.as_ref().map(|id| id.0.as_str()))
        .bind(format_timestamp(&attempt.updated_at))
        .bind(attempt.idempotency_key.as_str())
        .bind(i64::from(attempt.attempt_count))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Zero rows: the claim was settled or superseded, or never existed.
        match self.fetch(&attempt.idempotency_key).await? {
            Some(_) => Err(StoreError::ClaimLost(attempt.idempotency_key.to_string())),
            None => Err(StoreError::Backend(format!(
                "booking attempt `{}` was settled without a claim",
                attempt.idempotency_key
            ))),
        }
    }
}

fn attempt_from_row(row: SqliteRow) -> Result<BookingAttempt, RepositoryError> {
    let key_raw = row.try_get::<String, _>("idempotency_key")?;
    let idempotency_key = IdempotencyKey::parse(&key_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid idempotency key `{key_raw}` ({error})"))
    })?;

    let kind_raw = row.try_get::<String, _>("kind")?;
    let kind = BookingKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown booking kind `{kind_raw}`")))?;

    let result_raw = row.try_get::<String, _>("result")?;
    let result = AttemptResult::parse(&result_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown attempt result `{result_raw}`")))?;

    let travelers_raw = row.try_get::<String, _>("traveler_ids_json")?;
    let traveler_ids = serde_json::from_str::<Vec<String>>(&travelers_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid traveler ids ({error})")))?;

    Ok(BookingAttempt {
        idempotency_key,
        kind,
        offer_id: row.try_get("offer_id")?,
        provider: row.try_get("provider")?,
        request_id: row.try_get::<Option<String>, _>("request_id")?.map(RequestId),
        company_id: row.try_get::<Option<String>, _>("company_id")?.map(CompanyId),
        traveler_ids,
        approval_required: row.try_get("approval_required")?,
        approved_by: row.try_get::<Option<String>, _>("approved_by")?.map(ActorId),
        result,
        external_id: row.try_get("external_id")?,
        confirmation_code: row.try_get("confirmation_code")?,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        last_error: row.try_get("last_error")?,
        payload_hash: row.try_get("payload_hash")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use waypoint_core::domain::actor::{ActorId, CompanyId};
use waypoint_core::domain::request::{RequestId, RequestStatus, RequestType, TravelRequest};
use waypoint_core::errors::StoreError;
use waypoint_core::store::{RequestStore, SwapOutcome};

use super::{
    format_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32, RepositoryError,
};
use crate::DbPool;

const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct SqlRequestStore {
    pool: DbPool,
}

impl SqlRequestStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestStore for SqlRequestStore {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<TravelRequest>, StoreError> {
        let row = sqlx::query(
            "SELECT
                id,
                owner_id,
                company_id,
                request_type,
                status,
                destination,
                start_date,
                end_date,
                budget,
                approved_by,
                approved_at,
                rejection_reason,
                version,
                created_at,
                updated_at
             FROM travel_request
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.map(request_from_row).transpose()?)
    }

    async fn insert(&self, request: TravelRequest) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO travel_request (
                id,
                owner_id,
                company_id,
                request_type,
                status,
                destination,
                start_date,
                end_date,
                budget,
                approved_by,
                approved_at,
                rejection_reason,
                version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id.0)
        .bind(&request.owner_id.0)
        .bind(request.company_id.as_ref().map(|company| company.0.as_str()))
        .bind(request.request_type.as_str())
        .bind(request.status.as_str())
        .bind(&request.destination)
        .bind(request.start_date.format(DATE_FORMAT).to_string())
        .bind(request.end_date.format(DATE_FORMAT).to_string())
        .bind(request.budget.to_string())
        .bind(request.approved_by.as_ref().map(|actor| actor.0.as_str()))
        .bind(request.approved_at.as_ref().map(format_timestamp))
        .bind(&request.rejection_reason)
        .bind(i64::from(request.version))
        .bind(format_timestamp(&request.created_at))
        .bind(format_timestamp(&request.updated_at))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from);

        match result {
            Ok(_) => Ok(()),
            Err(error) if error.is_unique_violation() => Err(StoreError::Duplicate(request.id.0)),
            Err(error) => Err(error.into()),
        }
    }

    async fn compare_and_swap(
        &self,
        expected: RequestStatus,
        request: TravelRequest,
    ) -> Result<SwapOutcome, StoreError> {
        let result = sqlx::query(
            "UPDATE travel_request SET
                status = ?,
                destination = ?,
                start_date = ?,
                end_date = ?,
                budget = ?,
                approved_by = ?,
                approved_at = ?,
                rejection_reason = ?,
                version = ?,
                updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(request.status.as_str())
        .bind(&request.destination)
        .bind(request.start_date.format(DATE_FORMAT).to_string())
        .bind(request.end_date.format(DATE_FORMAT).to_string())
        .bind(request.budget.to_string())
        .bind(request.approved_by.as_ref().map(|actor| actor.0.as_str()))
        .bind(request.approved_at.as_ref().map(format_timestamp))
        .bind(&request.rejection_reason)
        .bind(i64::from(request.version))
        .bind(format_timestamp(&request.updated_at))
        .bind(&request.id.0)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if result.rows_affected() == 1 {
            Ok(SwapOutcome::Applied)
        } else {
            Ok(SwapOutcome::Stale)
        }
    }
}

fn request_from_row(row: SqliteRow) -> Result<TravelRequest, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = RequestStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown request status `{status_raw}`")))?;

    let type_raw = row.try_get::<String, _>("request_type")?;
    let request_type = RequestType::parse(&type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown request type `{type_raw}`")))?;

    let budget_raw = row.try_get::<String, _>("budget")?;
    let budget = Decimal::from_str(&budget_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid budget `{budget_raw}` ({error})"))
    })?;

    Ok(TravelRequest {
        id: RequestId(row.try_get("id")?),
        owner_id: ActorId(row.try_get("owner_id")?),
        company_id: row.try_get::<Option<String>, _>("company_id")?.map(CompanyId),
        request_type,
        status,
        destination: row.try_get("destination")?,
        start_date: parse_date("start_date", row.try_get("start_date")?)?,
        end_date: parse_date("end_date", row.try_get("end_date")?)?,
        budget,
        approved_by: row.try_get::<Option<String>, _>("approved_by")?.map(ActorId),
        approved_at: parse_optional_timestamp("approved_at", row.try_get("approved_at")?)?,
        rejection_reason: row.try_get("rejection_reason")?,
        version: parse_u32("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn parse_date(column: &str, value: String) -> Result<NaiveDate, RepositoryError> {
    NaiveDate::parse_from_str(&value, DATE_FORMAT).map_err(|error| {
        RepositoryError::Decode(format!("invalid date in `{column}`: `{value}` ({error})"))
    })
}

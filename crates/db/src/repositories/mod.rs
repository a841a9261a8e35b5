use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use waypoint_core::errors::StoreError;

pub mod audit;
pub mod booking;
pub mod outbox;
pub mod request;

pub use audit::SqlAuditStore;
pub use booking::SqlBookingStore;
pub use outbox::{OutboxRecord, SqlOutboxSink};
pub use request::SqlRequestStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
}

impl RepositoryError {
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(error) => {
                error.as_database_error().is_some_and(|db_error| db_error.is_unique_violation())
            }
            _ => false,
        }
    }
}

impl From<RepositoryError> for StoreError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(sqlx::Error::PoolTimedOut) => {
                StoreError::Backend("timed out waiting for a database connection".to_string())
            }
            RepositoryError::Database(error) => StoreError::Backend(error.to_string()),
            RepositoryError::Decode(message) => StoreError::Decode(message),
            RepositoryError::Encode(message) => StoreError::Backend(message),
        }
    }
}

/// Fixed-width RFC 3339 so that text ordering in SQL matches time ordering.
pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

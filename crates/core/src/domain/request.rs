use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::actor::{ActorId, CompanyId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(format!("TR-{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Draft,
    Submitted,
    Approved,
    Fulfilled,
    Completed,
    Cancelled,
}

impl RequestStatus {
    pub const ALL: [Self; 6] = [
        Self::Draft,
        Self::Submitted,
        Self::Approved,
        Self::Fulfilled,
        Self::Completed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Fulfilled => "fulfilled",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the canonical storage encoding only. Legacy vocabulary goes
    /// through `lifecycle::graph::normalize_status`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "approved" => Some(Self::Approved),
            "fulfilled" => Some(Self::Fulfilled),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Flight,
    Hotel,
    Visa,
    Package,
    Other,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flight => "flight",
            Self::Hotel => "hotel",
            Self::Visa => "visa",
            Self::Package => "package",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "flight" => Some(Self::Flight),
            "hotel" => Some(Self::Hotel),
            "visa" => Some(Self::Visa),
            "package" => Some(Self::Package),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TravelRequest {
    pub id: RequestId,
    pub owner_id: ActorId,
    pub company_id: Option<CompanyId>,
    pub request_type: RequestType,
    pub status: RequestStatus,
    pub destination: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub budget: Decimal,
    pub approved_by: Option<ActorId>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TravelRequest {
    pub fn is_owned_by(&self, actor_id: &ActorId) -> bool {
        &self.owner_id == actor_id
    }
}

/// Caller-supplied fields for a new request; identity, ownership and
/// timestamps are assigned by the lifecycle engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTravelRequest {
    pub request_type: RequestType,
    pub destination: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub budget: Decimal,
}

impl NewTravelRequest {
    pub fn validation_failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.destination.trim().is_empty() {
            failures.push("destination must not be empty".to_string());
        }
        if self.end_date < self.start_date {
            failures.push(format!(
                "end_date {} is before start_date {}",
                self.end_date, self.start_date
            ));
        }
        if self.budget.is_sign_negative() {
            failures.push("budget must not be negative".to_string());
        }
        failures
    }
}

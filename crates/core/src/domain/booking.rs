use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::actor::{ActorId, CompanyId};
use crate::domain::request::RequestId;

const MAX_KEY_LEN: usize = 128;

/// Stable key guaranteeing at most one provider booking per logical intent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidIdempotencyKey {
    #[error("idempotency key must not be empty")]
    Empty,
    #[error("idempotency key exceeds {MAX_KEY_LEN} characters")]
    TooLong,
    #[error("idempotency key contains unsupported character `{0}`")]
    UnsupportedCharacter(char),
}

impl IdempotencyKey {
    pub fn parse(raw: &str) -> Result<Self, InvalidIdempotencyKey> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(InvalidIdempotencyKey::Empty);
        }
        if value.len() > MAX_KEY_LEN {
            return Err(InvalidIdempotencyKey::TooLong);
        }
        let allowed = |ch: &char| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '-');
        if let Some(bad) = value.chars().find(|ch| !allowed(ch)) {
            return Err(InvalidIdempotencyKey::UnsupportedCharacter(bad));
        }
        Ok(Self(value.to_string()))
    }

    pub fn generate() -> Self {
        Self(format!("bk-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = InvalidIdempotencyKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(value: IdempotencyKey) -> Self {
        value.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingKind {
    Flight,
    Hotel,
}

impl BookingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flight => "flight",
            Self::Hotel => "hotel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "flight" => Some(Self::Flight),
            "hotel" => Some(Self::Hotel),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Pending,
    Success,
    Failed,
}

impl AttemptResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingAttempt {
    pub idempotency_key: IdempotencyKey,
    pub kind: BookingKind,
    pub offer_id: String,
    pub provider: String,
    pub request_id: Option<RequestId>,
    pub company_id: Option<CompanyId>,
    pub traveler_ids: Vec<String>,
    pub approval_required: bool,
    pub approved_by: Option<ActorId>,
    pub result: AttemptResult,
    pub external_id: Option<String>,
    pub confirmation_code: Option<String>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub payload_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BookingAttempt {
    pub fn is_settled(&self) -> bool {
        matches!(self.result, AttemptResult::Success)
    }
}

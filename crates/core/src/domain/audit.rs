use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::actor::{ActorId, CompanyId};
use crate::domain::request::RequestStatus;

pub const ENTITY_TRAVEL_REQUEST: &str = "travel_request";
pub const ENTITY_BOOKING: &str = "booking";
pub const ENTITY_AUDIT_LOG: &str = "audit_log";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditEntryId(pub String);

impl fmt::Display for AuditEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    StatusChanged,
    Approved,
    Rejected,
    Create,
    Update,
    Delete,
    Booked,
    BookingFailed,
    Exported,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusChanged => "status_changed",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Booked => "booked",
            Self::BookingFailed => "booking_failed",
            Self::Exported => "exported",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "status_changed" => Some(Self::StatusChanged),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "booked" => Some(Self::Booked),
            "booking_failed" => Some(Self::BookingFailed),
            "exported" => Some(Self::Exported),
            _ => None,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of a state change or privileged action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub entity_type: String,
    pub entity_id: String,
    pub action: AuditAction,
    pub from_status: Option<RequestStatus>,
    pub to_status: Option<RequestStatus>,
    pub actor_id: Option<ActorId>,
    pub tenant_id: Option<CompanyId>,
    pub correlation_id: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: AuditAction,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: AuditEntryId(Uuid::new_v4().to_string()),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action,
            from_status: None,
            to_status: None,
            actor_id: None,
            tenant_id: None,
            correlation_id: correlation_id.into(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_transition(mut self, from: Option<RequestStatus>, to: RequestStatus) -> Self {
        self.from_status = from;
        self.to_status = Some(to);
        self
    }

    pub fn with_actor(mut self, actor_id: &ActorId) -> Self {
        self.actor_id = Some(actor_id.clone());
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<&CompanyId>) -> Self {
        self.tenant_id = tenant_id.cloned();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

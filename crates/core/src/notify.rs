//! Fire-and-forget domain events emitted after a committed change.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::actor::CompanyId;
use crate::domain::booking::BookingAttempt;
use crate::domain::request::{RequestStatus, TravelRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StatusChanged,
    ReviewThreadRequested,
    BookingSettled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusChanged => "status_changed",
            Self::ReviewThreadRequested => "review_thread_requested",
            Self::BookingSettled => "booking_settled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "status_changed" => Some(Self::StatusChanged),
            "review_thread_requested" => Some(Self::ReviewThreadRequested),
            "booking_settled" => Some(Self::BookingSettled),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    /// Consumers must treat two events with the same key as one.
    pub dedupe_key: String,
    pub entity_id: String,
    pub tenant_id: Option<CompanyId>,
    pub correlation_id: String,
    pub attributes: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn status_changed(
        request: &TravelRequest,
        from: RequestStatus,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventKind::StatusChanged,
            dedupe_key: format!("status:{}:v{}", request.id, request.version),
            entity_id: request.id.0.clone(),
            tenant_id: request.company_id.clone(),
            correlation_id: correlation_id.into(),
            attributes: BTreeMap::from([
                ("from".to_string(), from.as_str().to_string()),
                ("to".to_string(), request.status.as_str().to_string()),
                ("owner_id".to_string(), request.owner_id.0.clone()),
            ]),
            occurred_at: request.updated_at,
        }
    }

    /// One review thread per request, whatever the number of submissions.
    pub fn review_thread(request: &TravelRequest, correlation_id: impl Into<String>) -> Self {
        Self {
            kind: EventKind::ReviewThreadRequested,
            dedupe_key: format!("review-thread:{}", request.id),
            entity_id: request.id.0.clone(),
            tenant_id: request.company_id.clone(),
            correlation_id: correlation_id.into(),
            attributes: BTreeMap::from([
                ("destination".to_string(), request.destination.clone()),
                ("owner_id".to_string(), request.owner_id.0.clone()),
            ]),
            occurred_at: request.updated_at,
        }
    }

    pub fn booking_settled(attempt: &BookingAttempt, correlation_id: impl Into<String>) -> Self {
        let mut attributes = BTreeMap::from([
            ("kind".to_string(), attempt.kind.as_str().to_string()),
            ("result".to_string(), attempt.result.as_str().to_string()),
            ("provider".to_string(), attempt.provider.clone()),
        ]);
        if let Some(request_id) = &attempt.request_id {
            attributes.insert("request_id".to_string(), request_id.0.clone());
        }
        Self {
            kind: EventKind::BookingSettled,
            dedupe_key: format!(
                "booking:{}:{}",
                attempt.idempotency_key,
                attempt.attempt_count
            ),
            entity_id: attempt.idempotency_key.as_str().to_string(),
            tenant_id: attempt.company_id.clone(),
            correlation_id: correlation_id.into(),
            attributes,
            occurred_at: attempt.updated_at,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// An event with the same dedupe key was already accepted.
    Duplicate,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> Result<PublishOutcome, NotificationError>;
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationSink {
    events: Arc<RwLock<Vec<DomainEvent>>>,
}

impl InMemoryNotificationSink {
    pub async fn events(&self) -> Vec<DomainEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn publish(&self, event: DomainEvent) -> Result<PublishOutcome, NotificationError> {
        let mut events = self.events.write().await;
        if events.iter().any(|existing| existing.dedupe_key == event.dedupe_key) {
            return Ok(PublishOutcome::Duplicate);
        }
        events.push(event);
        Ok(PublishOutcome::Published)
    }
}

/// Writes events to the log only. Used when no outbox is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn publish(&self, event: DomainEvent) -> Result<PublishOutcome, NotificationError> {
        info!(
            event_name = "notify.domain_event",
            kind = event.kind.as_str(),
            dedupe_key = %event.dedupe_key,
            entity_id = %event.entity_id,
            correlation_id = %event.correlation_id,
            "domain event published"
        );
        Ok(PublishOutcome::Published)
    }
}

//! Idempotent flight and hotel booking.
//!
//! Every booking is keyed by an [`IdempotencyKey`]. The key is claimed
//! atomically in the booking store before the provider is called, so at most
//! one caller talks to the provider for a given key and a successful attempt
//! is replayed, never re-executed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::authz::{require_actor, AuthorizationError, AuthorizationGate, Permission};
use crate::domain::actor::{Actor, ActorId, CompanyId};
use crate::domain::audit::{AuditAction, AuditEntry, ENTITY_BOOKING};
use crate::domain::booking::{AttemptResult, BookingAttempt, BookingKind, IdempotencyKey};
use crate::domain::request::{RequestId, RequestStatus, TravelRequest};
use crate::errors::{BookingError, ProviderError, StoreError};
use crate::notify::{DomainEvent, NotificationSink};
use crate::store::{with_timeout, BookingStore, ClaimOutcome, RequestStore};

pub mod provider;

pub use provider::{
    BookingProvider, ProviderBookingRequest, ProviderConfirmation, SandboxProvider,
    SANDBOX_PROVIDER,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingConfig {
    pub default_provider: String,
    pub provider_timeout: Duration,
    pub store_timeout: Duration,
    /// A pending claim older than this is considered abandoned and may be re-armed.
    pub stale_claim_after: Duration,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            default_provider: SANDBOX_PROVIDER.to_string(),
            provider_timeout: Duration::from_secs(15),
            store_timeout: Duration::from_secs(5),
            stale_claim_after: Duration::from_secs(300),
        }
    }
}

impl BookingConfig {
    /// Longest a live claimant can hold a key: the claim write, the provider
    /// call and the settle write.
    pub fn in_flight_budget(&self) -> Duration {
        self.provider_timeout.saturating_add(self.store_timeout.saturating_mul(2))
    }

    /// Age after which a pending claim is treated as abandoned. Never shorter
    /// than [`Self::in_flight_budget`].
    pub fn claim_window(&self) -> Duration {
        self.stale_claim_after.max(self.in_flight_budget())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingRequest {
    pub kind: BookingKind,
    pub offer_id: String,
    pub provider: Option<String>,
    pub traveler_ids: Vec<String>,
    /// When set, the linked request decides the tenant and may supply the approver.
    pub request_id: Option<RequestId>,
    pub approved_by: Option<ActorId>,
}

impl BookingRequest {
    fn validation_failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.offer_id.trim().is_empty() {
            failures.push("offer_id must not be empty".to_string());
        }
        if self.traveler_ids.is_empty() {
            failures.push("at least one traveler is required".to_string());
        }
        if self.traveler_ids.iter().any(|id| id.trim().is_empty()) {
            failures.push("traveler ids must not be blank".to_string());
        }
        failures
    }
}

/// Who is booking, for which tenant, under which correlation id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyContext {
    pub actor: Actor,
    /// Defaults to the actor's company. A linked travel request overrides it.
    pub company_id: Option<CompanyId>,
    pub correlation_id: String,
}

impl PolicyContext {
    pub fn new(actor: Actor, correlation_id: impl Into<String>) -> Self {
        Self { company_id: actor.company_id.clone(), actor, correlation_id: correlation_id.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BookingResult {
    pub attempt: BookingAttempt,
    /// True when a prior successful attempt was returned without calling the provider.
    pub replayed: bool,
}

#[derive(Clone)]
pub struct BookingExecutor {
    store: Arc<dyn BookingStore>,
    requests: Arc<dyn RequestStore>,
    providers: BTreeMap<String, Arc<dyn BookingProvider>>,
    audit: AuditLog,
    notifications: Arc<dyn NotificationSink>,
    gate: AuthorizationGate,
    config: BookingConfig,
}

impl BookingExecutor {
    pub fn new(
        store: Arc<dyn BookingStore>,
        requests: Arc<dyn RequestStore>,
        audit: AuditLog,
        notifications: Arc<dyn NotificationSink>,
        gate: AuthorizationGate,
        config: BookingConfig,
    ) -> Self {
        if config.stale_claim_after < config.in_flight_budget() {
            let millis =
                |duration: Duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
            warn!(
                event_name = "booking.claim_window.raised",
                correlation_id = "bootstrap",
                configured_ms = millis(config.stale_claim_after),
                effective_ms = millis(config.claim_window()),
                "stale claim window is shorter than a live booking; using the in-flight budget"
            );
        }
        Self { store, requests, providers: BTreeMap::new(), audit, notifications, gate, config }
    }

    pub fn with_provider(mut self, provider: Arc<dyn BookingProvider>) -> Self {
        self.providers.insert(provider.name().to_ascii_lowercase(), provider);
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub async fn book(
        &self,
        request: BookingRequest,
        key: IdempotencyKey,
        context: PolicyContext,
    ) -> Result<BookingResult, BookingError> {
        let actor = require_actor(Some(&context.actor))?;
        let failures = request.validation_failures();
        if !failures.is_empty() {
            return Err(BookingError::Validation(failures.join("; ")));
        }
        let provider_name = request
            .provider
            .as_deref()
            .map(|name| name.trim().to_ascii_lowercase())
            .unwrap_or_else(|| self.config.default_provider.to_ascii_lowercase());
        let Some(provider) = self.providers.get(&provider_name).cloned() else {
            return Err(BookingError::Validation(format!("unknown provider `{provider_name}`")));
        };

        let linked = match &request.request_id {
            Some(request_id) => Some(self.linked_request(request_id, actor).await?),
            None => None,
        };
        let company_id = linked
            .as_ref()
            .and_then(|linked| linked.company_id.clone())
            .or_else(|| context.company_id.clone());
        let payload_hash = payload_hash(&request, &provider_name, company_id.as_ref(), &actor.id);

        let find = self.store.find(&key);
        if let Some(existing) = with_timeout("bookings.find", self.config.store_timeout, find).await?
        {
            if existing.payload_hash != payload_hash {
                return Err(BookingError::KeyReuse(key));
            }
            if existing.result == AttemptResult::Success {
                return Ok(self.replay(existing, &context.correlation_id));
            }
        }

        let linked_approver = linked
            .as_ref()
            .filter(|linked| {
                matches!(linked.status, RequestStatus::Approved | RequestStatus::Fulfilled)
            })
            .and_then(|linked| linked.approved_by.clone());
        let approved_by = match (&company_id, request.approved_by.clone().or(linked_approver)) {
            (_, Some(approver)) => Some(approver),
            (None, None) => None,
            (Some(company), None) if self.is_approver_for(actor, company) => Some(actor.id.clone()),
            (Some(company), None) => {
                warn!(
                    event_name = "booking.approval_required",
                    correlation_id = %context.correlation_id,
                    idempotency_key = %key,
                    company_id = %company,
                    actor_id = %actor.id,
                    "tenant booking refused without an approver"
                );
                return Err(BookingError::ApprovalRequired { company_id: company.0.clone() });
            }
        };

        let now = Utc::now();
        let candidate = BookingAttempt {
            idempotency_key: key.clone(),
            kind: request.kind,
            offer_id: request.offer_id.trim().to_string(),
            provider: provider_name.clone(),
            request_id: request.request_id.clone(),
            company_id: company_id.clone(),
            traveler_ids: request.traveler_ids.clone(),
            approval_required: company_id.is_some(),
            approved_by,
            result: AttemptResult::Pending,
            external_id: None,
            confirmation_code: None,
            attempt_count: 0,
            last_error: None,
            payload_hash,
            created_at: now,
            updated_at: now,
        };
        let stale_before = now
            - chrono::Duration::from_std(self.config.claim_window())
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let claim = self.store.claim(candidate, stale_before);
        let attempt = match with_timeout("bookings.claim", self.config.store_timeout, claim).await? {
            ClaimOutcome::Claimed(attempt) => attempt,
            ClaimOutcome::Existing(existing) if existing.result == AttemptResult::Success => {
                return Ok(self.replay(existing, &context.correlation_id));
            }
            ClaimOutcome::Existing(_) => {
                info!(
                    event_name = "booking.in_flight",
                    correlation_id = %context.correlation_id,
                    idempotency_key = %key,
                    "booking key is held by another caller"
                );
                return Err(BookingError::InFlight(key));
            }
        };

        let provider_request = ProviderBookingRequest {
            kind: attempt.kind,
            offer_id: attempt.offer_id.clone(),
            traveler_ids: attempt.traveler_ids.clone(),
            request_id: attempt.request_id.as_ref().map(|id| id.0.clone()),
            company_id: attempt.company_id.as_ref().map(|id| id.0.clone()),
        };
        let outcome = self.call_provider(provider.as_ref(), &provider_request, &key).await;

        let mut settled = attempt;
        settled.updated_at = Utc::now();
        let failure = match outcome {
            Ok(confirmation) => {
                settled.result = AttemptResult::Success;
                settled.external_id = confirmation.external_id;
                settled.confirmation_code = confirmation.confirmation_code;
                settled.last_error = None;
                None
            }
            Err(provider_error) => {
                settled.result = AttemptResult::Failed;
                settled.last_error = Some(provider_error.to_string());
                Some(provider_error)
            }
        };

        let settle = self.store.settle(settled.clone());
        if let Err(store_error) =
            with_timeout("bookings.settle", self.config.store_timeout, settle).await
        {
            if let StoreError::ClaimLost(_) = store_error {
                warn!(
                    event_name = "booking.claim_lost",
                    correlation_id = %context.correlation_id,
                    idempotency_key = %key,
                    attempt_count = settled.attempt_count,
                    result = settled.result.as_str(),
                    "a newer attempt owns the key; outcome discarded"
                );
                return Err(BookingError::InFlight(key));
            }
            error!(
                event_name = "booking.settle_failed",
                correlation_id = %context.correlation_id,
                idempotency_key = %key,
                result = settled.result.as_str(),
                error = %store_error,
                "booking outcome could not be recorded; key stays pending until stale"
            );
            return Err(store_error.into());
        }

        self.record(&settled, actor, &context.correlation_id).await;
        self.publish(&settled, &context.correlation_id).await;

        match failure {
            None => {
                info!(
                    event_name = "booking.confirmed",
                    correlation_id = %context.correlation_id,
                    idempotency_key = %key,
                    provider = %settled.provider,
                    attempt_count = settled.attempt_count,
                    "booking confirmed"
                );
                Ok(BookingResult { attempt: settled, replayed: false })
            }
            Some(provider_error) => {
                warn!(
                    event_name = "booking.failed",
                    correlation_id = %context.correlation_id,
                    idempotency_key = %key,
                    provider = %settled.provider,
                    attempt_count = settled.attempt_count,
                    error = %provider_error,
                    "booking failed; key remains retryable"
                );
                Err(provider_error.into())
            }
        }
    }

    /// Loads the travel request a booking is made for. An actor tied to one
    /// tenant cannot book against another tenant's request.
    async fn linked_request(
        &self,
        request_id: &RequestId,
        actor: &Actor,
    ) -> Result<TravelRequest, BookingError> {
        let find = self.requests.find_by_id(request_id);
        let linked = with_timeout("requests.find_by_id", self.config.store_timeout, find)
            .await?
            .ok_or_else(|| BookingError::RequestNotFound(request_id.clone()))?;

        if let (Some(tenant), Some(own)) = (&linked.company_id, &actor.company_id) {
            if tenant != own && !self.gate.has_permission(&actor.role, Permission::ManageAllTenants)
            {
                return Err(AuthorizationError::TenantMismatch {
                    actor_id: actor.id.0.clone(),
                    tenant_id: tenant.0.clone(),
                }
                .into());
            }
        }
        Ok(linked)
    }

    fn is_approver_for(&self, actor: &Actor, company_id: &CompanyId) -> bool {
        self.gate.has_permission(&actor.role, Permission::ManageAllTenants)
            || (actor.belongs_to(company_id)
                && self.gate.has_permission(&actor.role, Permission::ApproveRequests))
    }

    async fn call_provider(
        &self,
        provider: &dyn BookingProvider,
        request: &ProviderBookingRequest,
        key: &IdempotencyKey,
    ) -> Result<ProviderConfirmation, ProviderError> {
        let timeout = self.config.provider_timeout;
        let confirmation = match tokio::time::timeout(timeout, provider.book(request, key)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProviderError::Timeout {
                    provider: provider.name().to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        };
        if !confirmation.has_identifier() {
            return Err(ProviderError::MissingConfirmation { provider: provider.name().to_string() });
        }
        Ok(confirmation)
    }

    fn replay(&self, attempt: BookingAttempt, correlation_id: &str) -> BookingResult {
        info!(
            event_name = "booking.replayed",
            correlation_id = %correlation_id,
            idempotency_key = %attempt.idempotency_key,
            "returning recorded booking without calling the provider"
        );
        BookingResult { attempt, replayed: true }
    }

    async fn record(&self, attempt: &BookingAttempt, actor: &Actor, correlation_id: &str) {
        let action = match attempt.result {
            AttemptResult::Success => AuditAction::Booked,
            _ => AuditAction::BookingFailed,
        };
        let mut entry = AuditEntry::new(
            ENTITY_BOOKING,
            attempt.idempotency_key.as_str(),
            action,
            correlation_id,
        )
        .with_actor(&actor.id)
        .with_tenant(attempt.company_id.as_ref())
        .with_metadata("kind", attempt.kind.as_str())
        .with_metadata("offer_id", attempt.offer_id.clone())
        .with_metadata("provider", attempt.provider.clone())
        .with_metadata("attempt_count", attempt.attempt_count.to_string());
        if let Some(request_id) = &attempt.request_id {
            entry = entry.with_metadata("request_id", request_id.0.clone());
        }
        if let Some(approver) = &attempt.approved_by {
            entry = entry.with_metadata("approved_by", approver.0.clone());
        }
        if let Some(last_error) = &attempt.last_error {
            entry = entry.with_metadata("error", last_error.clone());
        }

        if let Err(audit_error) = self.audit.append(entry).await {
            warn!(
                event_name = "booking.audit.write_failed",
                correlation_id = %correlation_id,
                idempotency_key = %attempt.idempotency_key,
                error = %audit_error,
                "booking settled but audit entry was not written"
            );
        }
    }

    async fn publish(&self, attempt: &BookingAttempt, correlation_id: &str) {
        let event = DomainEvent::booking_settled(attempt, correlation_id);
        let publish = self.notifications.publish(event);
        match tokio::time::timeout(self.config.store_timeout, publish).await {
            Ok(Ok(_)) => {}
            Ok(Err(notify_error)) => warn!(
                event_name = "booking.notification.failed",
                correlation_id = %correlation_id,
                error = %notify_error,
                "booking event was not delivered"
            ),
            Err(_) => warn!(
                event_name = "booking.notification.failed",
                correlation_id = %correlation_id,
                error = "timed out",
                "booking event was not delivered"
            ),
        }
    }
}

/// SHA-256 over the fields that define the booking intent, including who
/// asked for it, so a key only replays for its original actor. The approver is
/// excluded so a retry may add one.
fn payload_hash(
    request: &BookingRequest,
    provider: &str,
    company_id: Option<&CompanyId>,
    actor_id: &ActorId,
) -> String {
    let mut travelers: Vec<&str> = request.traveler_ids.iter().map(|id| id.trim()).collect();
    travelers.sort_unstable();
    let canonical = [
        request.kind.as_str(),
        request.offer_id.trim(),
        provider,
        request.request_id.as_ref().map(|id| id.0.as_str()).unwrap_or(""),
        company_id.map(|id| id.0.as_str()).unwrap_or(""),
        actor_id.0.as_str(),
        &travelers.join(","),
    ]
    .join("\n");
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

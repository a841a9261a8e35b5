use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::authz::{require_actor, AuthorizationError, AuthorizationGate, Permission};
use crate::domain::actor::Actor;
use crate::domain::audit::{AuditAction, AuditEntry, ENTITY_TRAVEL_REQUEST};
use crate::domain::request::{NewTravelRequest, RequestId, RequestStatus, TravelRequest};
use crate::errors::LifecycleError;
use crate::lifecycle::graph::{can_transition, normalize_status};
use crate::lifecycle::{SideEffect, TransitionAction};
use crate::notify::{DomainEvent, NotificationSink};
use crate::store::{with_timeout, RequestStore, SwapOutcome};

pub const DEFAULT_REJECTION_REASON: &str = "Rejected by approver";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub store_timeout: Duration,
    pub default_rejection_reason: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            default_rejection_reason: DEFAULT_REJECTION_REASON.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransitionOptions {
    pub action: Option<TransitionAction>,
    pub rejection_reason: Option<String>,
    pub correlation_id: Option<String>,
}

impl TransitionOptions {
    pub fn approve() -> Self {
        Self { action: Some(TransitionAction::Approve), ..Self::default() }
    }

    pub fn reject(reason: Option<&str>) -> Self {
        Self {
            action: Some(TransitionAction::Reject),
            rejection_reason: reason.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub submit_immediately: bool,
    pub correlation_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransitionReceipt {
    pub request: TravelRequest,
    pub audit: SideEffect,
    pub notification: SideEffect,
}

/// What the caller is trying to do, which decides the permission checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Intent {
    Decide,
    Service,
    OwnerOrService,
}

#[derive(Clone)]
pub struct LifecycleEngine {
    requests: Arc<dyn RequestStore>,
    audit: AuditLog,
    notifications: Arc<dyn NotificationSink>,
    gate: AuthorizationGate,
    config: LifecycleConfig,
}

impl LifecycleEngine {
    pub fn new(
        requests: Arc<dyn RequestStore>,
        audit: AuditLog,
        notifications: Arc<dyn NotificationSink>,
        gate: AuthorizationGate,
        config: LifecycleConfig,
    ) -> Self {
        Self { requests, audit, notifications, gate, config }
    }

    pub fn gate(&self) -> &AuthorizationGate {
        &self.gate
    }

    pub async fn create(
        &self,
        draft: NewTravelRequest,
        actor: &Actor,
        options: CreateOptions,
    ) -> Result<TransitionReceipt, LifecycleError> {
        let actor = require_actor(Some(actor))?;
        let failures = draft.validation_failures();
        if !failures.is_empty() {
            return Err(LifecycleError::Validation(failures.join("; ")));
        }

        let correlation_id = correlation_id_or_new(options.correlation_id);
        let now = Utc::now();
        let status = match options.submit_immediately {
            true => RequestStatus::Submitted,
            false => RequestStatus::Draft,
        };
        let request = TravelRequest {
            id: RequestId::generate(),
            owner_id: actor.id.clone(),
            company_id: actor.company_id.clone(),
            request_type: draft.request_type,
            status,
            destination: draft.destination.trim().to_string(),
            start_date: draft.start_date,
            end_date: draft.end_date,
            budget: draft.budget,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let insert = self.requests.insert(request.clone());
        with_timeout("requests.insert", self.config.store_timeout, insert).await?;

        info!(
            event_name = "lifecycle.request.created",
            correlation_id = %correlation_id,
            request_id = %request.id,
            actor_id = %actor.id,
            status = request.status.as_str(),
            "travel request created"
        );

        let entry = AuditEntry::new(
            ENTITY_TRAVEL_REQUEST,
            request.id.0.clone(),
            AuditAction::Create,
            correlation_id.clone(),
        )
        .with_transition(None, request.status)
        .with_actor(&actor.id)
        .with_tenant(request.company_id.as_ref())
        .with_metadata("request_type", request.request_type.as_str())
        .with_metadata("destination", request.destination.clone());
        let audit = self.record(entry, &correlation_id).await;

        let notification = if request.status == RequestStatus::Submitted {
            self.notify(DomainEvent::review_thread(&request, correlation_id.clone())).await
        } else {
            SideEffect::Delivered
        };

        Ok(TransitionReceipt { request, audit, notification })
    }

    pub async fn get(
        &self,
        request_id: &RequestId,
        actor: &Actor,
    ) -> Result<TravelRequest, LifecycleError> {
        let actor = require_actor(Some(actor))?;
        let request = self.load(request_id).await?;

        let same_tenant = request.company_id == actor.company_id;
        let visible = request.is_owned_by(&actor.id)
            || self.gate.has_permission(&actor.role, Permission::ManageAllTenants)
            || self.gate.has_permission(&actor.role, Permission::ManageServiceRequests)
            || (same_tenant && self.gate.has_permission(&actor.role, Permission::ApproveRequests));
        if !visible {
            return Err(AuthorizationError::NotOwner { actor_id: actor.id.0.clone() }.into());
        }
        Ok(request)
    }

    /// Moves a request to `target` (canonical or legacy status name).
    ///
    /// Authorization is decided before legality, so a caller without rights
    /// never learns whether the transition would have been valid. The write
    /// is a compare-and-swap on the status that was read; the loser of a
    /// race gets `Conflict` and no audit entry.
    pub async fn transition(
        &self,
        request_id: &RequestId,
        target: &str,
        actor: &Actor,
        options: TransitionOptions,
    ) -> Result<TransitionReceipt, LifecycleError> {
        let actor = require_actor(Some(actor))?;
        let current = self.load(request_id).await?;
        let resolved = normalize_status(target)?;
        let to = resolved.status;

        let implied = if resolved.implies_reject {
            Some(TransitionAction::Reject)
        } else if to == RequestStatus::Approved {
            Some(TransitionAction::Approve)
        } else {
            None
        };
        let action = match (options.action, implied) {
            (Some(explicit), _) if !action_targets(explicit, to) => {
                return Err(LifecycleError::ActionMismatch { action: explicit, to });
            }
            (Some(explicit), _) => Some(explicit),
            (None, implied) => implied,
        };

        let intent = match (action, to) {
            (Some(_), _) => Intent::Decide,
            (None, RequestStatus::Fulfilled | RequestStatus::Completed) => Intent::Service,
            (None, _) => Intent::OwnerOrService,
        };
        self.authorize(actor, &current, intent)?;

        let from = current.status;
        if !can_transition(from, to) {
            return Err(LifecycleError::InvalidTransition { from, to });
        }

        let correlation_id = correlation_id_or_new(options.correlation_id);
        let now = Utc::now();
        let mut updated = current.clone();
        updated.status = to;
        updated.updated_at = now;
        updated.version = current.version.saturating_add(1);
        match action {
            Some(TransitionAction::Approve) => {
                updated.approved_by = Some(actor.id.clone());
                updated.approved_at = Some(now);
            }
            Some(TransitionAction::Reject) => {
                let reason = options
                    .rejection_reason
                    .as_deref()
                    .map(str::trim)
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or(self.config.default_rejection_reason.as_str());
                updated.rejection_reason = Some(reason.to_string());
            }
            None => {}
        }

        let swap = with_timeout(
            "requests.compare_and_swap",
            self.config.store_timeout,
            self.requests.compare_and_swap(from, updated.clone()),
        )
        .await?;
        if swap == SwapOutcome::Stale {
            warn!(
                event_name = "lifecycle.transition.conflict",
                correlation_id = %correlation_id,
                request_id = %request_id,
                expected = from.as_str(),
                "concurrent update detected; transition discarded"
            );
            return Err(LifecycleError::Conflict { id: request_id.clone(), expected: from });
        }

        info!(
            event_name = "lifecycle.transition.applied",
            correlation_id = %correlation_id,
            request_id = %request_id,
            actor_id = %actor.id,
            from = from.as_str(),
            to = to.as_str(),
            version = updated.version,
            "travel request transitioned"
        );

        let audit_action = match action {
            Some(TransitionAction::Approve) => AuditAction::Approved,
            Some(TransitionAction::Reject) => AuditAction::Rejected,
            None => AuditAction::StatusChanged,
        };
        let mut entry = AuditEntry::new(
            ENTITY_TRAVEL_REQUEST,
            request_id.0.clone(),
            audit_action,
            correlation_id.clone(),
        )
        .with_transition(Some(from), to)
        .with_actor(&actor.id)
        .with_tenant(updated.company_id.as_ref())
        .with_metadata("version", updated.version.to_string());
        if let Some(reason) = &updated.rejection_reason {
            if action == Some(TransitionAction::Reject) {
                entry = entry.with_metadata("rejection_reason", reason.clone());
            }
        }
        let audit = self.record(entry, &correlation_id).await;

        let status_event = DomainEvent::status_changed(&updated, from, correlation_id.clone());
        let mut deliveries = vec![self.notify(status_event).await];
        if to == RequestStatus::Submitted {
            let review = DomainEvent::review_thread(&updated, correlation_id.clone());
            deliveries.push(self.notify(review).await);
        }
        let notification = SideEffect::combine(deliveries);

        Ok(TransitionReceipt { request: updated, audit, notification })
    }

    fn authorize(
        &self,
        actor: &Actor,
        request: &TravelRequest,
        intent: Intent,
    ) -> Result<(), AuthorizationError> {
        match intent {
            Intent::Decide => {
                self.gate.require_permission(Some(actor), Permission::ApproveRequests)?;
                let Some(company_id) = &request.company_id else {
                    return Ok(());
                };
                if actor.belongs_to(company_id)
                    || self.gate.has_permission(&actor.role, Permission::ManageAllTenants)
                {
                    return Ok(());
                }
                Err(AuthorizationError::TenantMismatch {
                    actor_id: actor.id.0.clone(),
                    tenant_id: company_id.0.clone(),
                })
            }
            Intent::Service => self
                .gate
                .require_permission(Some(actor), Permission::ManageServiceRequests)
                .map(|_| ()),
            Intent::OwnerOrService => {
                if request.is_owned_by(&actor.id)
                    || self.gate.has_permission(&actor.role, Permission::ManageServiceRequests)
                {
                    return Ok(());
                }
                Err(AuthorizationError::NotOwner { actor_id: actor.id.0.clone() })
            }
        }
    }

    async fn load(&self, request_id: &RequestId) -> Result<TravelRequest, LifecycleError> {
        let find = self.requests.find_by_id(request_id);
        with_timeout("requests.find_by_id", self.config.store_timeout, find)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(request_id.clone()))
    }

    async fn record(&self, entry: AuditEntry, correlation_id: &str) -> SideEffect {
        let entity_id = entry.entity_id.clone();
        match self.audit.append(entry).await {
            Ok(_) => SideEffect::Delivered,
            Err(error) => {
                warn!(
                    event_name = "lifecycle.audit.write_failed",
                    correlation_id = %correlation_id,
                    request_id = %entity_id,
                    error = %error,
                    "change committed but audit entry was not written"
                );
                SideEffect::Failed(error.to_string())
            }
        }
    }

    async fn notify(&self, event: DomainEvent) -> SideEffect {
        let dedupe_key = event.dedupe_key.clone();
        let correlation_id = event.correlation_id.clone();
        let publish = self.notifications.publish(event);
        let published = tokio::time::timeout(self.config.store_timeout, publish).await;
        let failure = match published {
            Ok(Ok(_)) => return SideEffect::Delivered,
            Ok(Err(error)) => error.to_string(),
            Err(_) => format!("notification `{dedupe_key}` timed out"),
        };
        warn!(
            event_name = "lifecycle.notification.failed",
            correlation_id = %correlation_id,
            dedupe_key = %dedupe_key,
            error = %failure,
            "domain event was not delivered"
        );
        SideEffect::Failed(failure)
    }
}

fn action_targets(action: TransitionAction, to: RequestStatus) -> bool {
    match action {
        TransitionAction::Approve => to == RequestStatus::Approved,
        TransitionAction::Reject => to == RequestStatus::Cancelled,
    }
}

fn correlation_id_or_new(supplied: Option<String>) -> String {
    supplied
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| format!("corr-{}", Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use tokio::sync::Barrier;

    use super::{
        CreateOptions, LifecycleConfig, LifecycleEngine, TransitionOptions,
        DEFAULT_REJECTION_REASON,
    };
    use crate::audit::{AuditFilter, AuditLog, Pagination};
    use crate::authz::{roles, AuthorizationError, AuthorizationGate};
    use crate::domain::actor::Actor;
    use crate::domain::audit::{AuditAction, AuditEntry};
    use crate::domain::request::{
        NewTravelRequest, RequestId, RequestStatus, RequestType, TravelRequest,
    };
    use crate::errors::{LifecycleError, StoreError};
    use crate::lifecycle::{SideEffect, TransitionAction};
    use crate::notify::{
        DomainEvent, EventKind, InMemoryNotificationSink, NotificationError, NotificationSink,
        PublishOutcome,
    };
    use crate::store::{
        AuditStore, InMemoryAuditStore, InMemoryRequestStore, RequestStore, SwapOutcome,
    };

    struct Harness {
        engine: LifecycleEngine,
        requests: InMemoryRequestStore,
        audit: InMemoryAuditStore,
        events: InMemoryNotificationSink,
    }

    fn harness() -> Harness {
        let requests = InMemoryRequestStore::default();
        let audit = InMemoryAuditStore::default();
        let events = InMemoryNotificationSink::default();
        let engine = engine_with(
            Arc::new(requests.clone()),
            Arc::new(audit.clone()),
            Arc::new(events.clone()),
        );
        Harness { engine, requests, audit, events }
    }

    fn engine_with(
        requests: Arc<dyn RequestStore>,
        audit: Arc<dyn AuditStore>,
        events: Arc<dyn NotificationSink>,
    ) -> LifecycleEngine {
        let gate = AuthorizationGate::default();
        let audit_log = AuditLog::new(audit, gate.clone(), Duration::from_secs(1));
        LifecycleEngine::new(requests, audit_log, events, gate, LifecycleConfig::default())
    }

    fn draft() -> NewTravelRequest {
        NewTravelRequest {
            request_type: RequestType::Flight,
            destination: "Singapore".to_string(),
            start_date: NaiveDate::from_ymd_opt(2026, 11, 9).expect("date"),
            end_date: NaiveDate::from_ymd_opt(2026, 11, 14).expect("date"),
            budget: Decimal::new(420_000, 2),
        }
    }

    fn employee() -> Actor {
        Actor::new("U-emp", roles::EMPLOYEE).with_company("ACME")
    }

    fn approver() -> Actor {
        Actor::new("U-mgr", roles::CORPORATE_CLIENT).with_company("ACME")
    }

    fn agent() -> Actor {
        Actor::new("U-agent", roles::TRAVEL_AGENT)
    }

    async fn submitted_request(harness: &Harness) -> TravelRequest {
        harness
            .engine
            .create(
                draft(),
                &employee(),
                CreateOptions { submit_immediately: true, ..CreateOptions::default() },
            )
            .await
            .expect("create submitted")
            .request
    }

    async fn entries_for(harness: &Harness, id: &RequestId) -> Vec<AuditEntry> {
        harness
            .audit
            .entries()
            .await
            .into_iter()
            .filter(|entry| entry.entity_id == id.0)
            .collect()
    }

    async fn review_threads(events: &InMemoryNotificationSink) -> usize {
        events
            .events()
            .await
            .into_iter()
            .filter(|event| event.kind == EventKind::ReviewThreadRequested)
            .count()
    }

    #[tokio::test]
    async fn create_assigns_owner_tenant_and_audits() {
        let harness = harness();
        let receipt = harness
            .engine
            .create(draft(), &employee(), CreateOptions::default())
            .await
            .expect("create");

        assert_eq!(receipt.request.status, RequestStatus::Draft);
        assert_eq!(receipt.request.owner_id.0, "U-emp");
        assert_eq!(receipt.request.company_id.as_ref().map(|c| c.0.as_str()), Some("ACME"));
        assert_eq!(receipt.request.version, 1);
        assert!(receipt.audit.is_delivered());

        let entries = entries_for(&harness, &receipt.request.id).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Create);
        assert_eq!(entries[0].from_status, None);
        assert_eq!(entries[0].to_status, Some(RequestStatus::Draft));
        assert!(harness.events.events().await.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_invalid_drafts() {
        let harness = harness();
        let mut invalid = draft();
        invalid.destination = String::new();

        let result = harness.engine.create(invalid, &employee(), CreateOptions::default()).await;
        assert!(matches!(result, Err(LifecycleError::Validation(ref m)) if m.contains("destination")));
        assert!(harness.audit.entries().await.is_empty());
    }

    #[tokio::test]
    async fn submitting_twice_opens_one_review_thread() {
        let harness = harness();
        let created = harness
            .engine
            .create(draft(), &employee(), CreateOptions::default())
            .await
            .expect("create")
            .request;

        harness
            .engine
            .transition(&created.id, "submitted", &employee(), TransitionOptions::default())
            .await
            .expect("submit");
        assert_eq!(review_threads(&harness.events).await, 1);

        // a retry of the same publish is absorbed by the dedupe key
        let stored = harness.requests.find_by_id(&created.id).await.expect("find").expect("row");
        harness
            .events
            .publish(DomainEvent::review_thread(&stored, "retry"))
            .await
            .expect("publish");
        assert_eq!(review_threads(&harness.events).await, 1);
    }

    #[tokio::test]
    async fn pending_alias_on_draft_submits() {
        let harness = harness();
        let created = harness
            .engine
            .create(draft(), &employee(), CreateOptions::default())
            .await
            .expect("create")
            .request;

        let receipt = harness
            .engine
            .transition(&created.id, "pending", &employee(), TransitionOptions::default())
            .await
            .expect("pending resolves to submitted");

        assert_eq!(receipt.request.status, RequestStatus::Submitted);
        assert_eq!(receipt.request.version, 2);
    }

    #[tokio::test]
    async fn unknown_status_is_rejected_before_anything_else() {
        let harness = harness();
        let request = submitted_request(&harness).await;

        let result = harness
            .engine
            .transition(&request.id, "teleported", &approver(), TransitionOptions::default())
            .await;
        assert_eq!(result.err(), Some(LifecycleError::InvalidStatus { value: "teleported".into() }));
    }

    #[tokio::test]
    async fn approval_stamps_approver_and_time_together() {
        let harness = harness();
        let request = submitted_request(&harness).await;

        let receipt = harness
            .engine
            .transition(&request.id, "approved", &approver(), TransitionOptions::approve())
            .await
            .expect("approve");

        assert_eq!(receipt.request.status, RequestStatus::Approved);
        assert_eq!(receipt.request.approved_by.as_ref().map(|id| id.0.as_str()), Some("U-mgr"));
        assert!(receipt.request.approved_at.is_some());
        assert!(receipt.request.rejection_reason.is_none());

        let fulfilled = harness
            .engine
            .transition(&request.id, "fulfilled", &agent(), TransitionOptions::default())
            .await
            .expect("fulfil")
            .request;
        assert_eq!(fulfilled.approved_by, receipt.request.approved_by);
        assert_eq!(fulfilled.approved_at, receipt.request.approved_at);
    }

    #[tokio::test]
    async fn non_approval_transitions_never_stamp_approval() {
        let harness = harness();
        let request = submitted_request(&harness).await;

        let cancelled = harness
            .engine
            .transition(&request.id, "cancelled", &employee(), TransitionOptions::default())
            .await
            .expect("owner cancels")
            .request;

        assert!(cancelled.approved_by.is_none());
        assert!(cancelled.approved_at.is_none());
        assert!(cancelled.rejection_reason.is_none());
    }

    #[tokio::test]
    async fn rejection_always_records_a_reason() {
        let harness = harness();
        let first = submitted_request(&harness).await;
        let second = submitted_request(&harness).await;

        let explicit = harness
            .engine
            .transition(&first.id, "cancelled", &approver(), TransitionOptions::reject(Some("over budget")))
            .await
            .expect("reject with reason")
            .request;
        let implied = harness
            .engine
            .transition(&second.id, "rejected", &approver(), TransitionOptions::default())
            .await
            .expect("reject via alias")
            .request;

        assert_eq!(explicit.status, RequestStatus::Cancelled);
        assert_eq!(explicit.rejection_reason.as_deref(), Some("over budget"));
        assert_eq!(implied.rejection_reason.as_deref(), Some(DEFAULT_REJECTION_REASON));

        let entries = entries_for(&harness, &first.id).await;
        let rejected = entries.last().expect("rejection entry");
        assert_eq!(rejected.action, AuditAction::Rejected);
        assert_eq!(rejected.metadata.get("rejection_reason").map(String::as_str), Some("over budget"));
    }

    #[tokio::test]
    async fn explicit_action_must_agree_with_target() {
        let harness = harness();
        let request = submitted_request(&harness).await;

        let result = harness
            .engine
            .transition(&request.id, "approved", &approver(), TransitionOptions::reject(None))
            .await;
        assert_eq!(
            result.err(),
            Some(LifecycleError::ActionMismatch {
                action: TransitionAction::Reject,
                to: RequestStatus::Approved,
            })
        );
    }

    #[tokio::test]
    async fn illegal_pairs_fail_with_both_statuses() {
        let harness = harness();
        let created = harness
            .engine
            .create(draft(), &employee(), CreateOptions::default())
            .await
            .expect("create")
            .request;

        let skip = harness
            .engine
            .transition(&created.id, "fulfilled", &agent(), TransitionOptions::default())
            .await;
        assert_eq!(
            skip.err(),
            Some(LifecycleError::InvalidTransition {
                from: RequestStatus::Draft,
                to: RequestStatus::Fulfilled,
            })
        );

        let same = harness
            .engine
            .transition(&created.id, "draft", &employee(), TransitionOptions::default())
            .await;
        assert_eq!(
            same.err(),
            Some(LifecycleError::InvalidTransition {
                from: RequestStatus::Draft,
                to: RequestStatus::Draft,
            })
        );
        assert_eq!(entries_for(&harness, &created.id).await.len(), 1);
    }

    #[tokio::test]
    async fn forbidden_approval_leaves_state_and_audit_untouched() {
        let harness = harness();
        let request = submitted_request(&harness).await;
        let before = entries_for(&harness, &request.id).await.len();

        let result = harness
            .engine
            .transition(&request.id, "approved", &employee(), TransitionOptions::approve())
            .await;

        assert!(matches!(
            result,
            Err(LifecycleError::Forbidden(AuthorizationError::MissingPermission { .. }))
        ));
        let stored = harness.requests.find_by_id(&request.id).await.expect("find").expect("row");
        assert_eq!(stored, request);
        assert_eq!(entries_for(&harness, &request.id).await.len(), before);
    }

    #[tokio::test]
    async fn authorization_is_reported_before_legality() {
        let harness = harness();
        let request = submitted_request(&harness).await;

        // submitted -> completed is illegal, but the employee learns only that they are forbidden
        let result = harness
            .engine
            .transition(&request.id, "completed", &employee(), TransitionOptions::default())
            .await;
        assert!(matches!(result, Err(LifecycleError::Forbidden(_))));
    }

    #[tokio::test]
    async fn approvers_from_other_tenants_are_refused() {
        let harness = harness();
        let request = submitted_request(&harness).await;
        let outsider = Actor::new("U-globex", roles::CORPORATE_CLIENT).with_company("GLOBEX");

        let result = harness
            .engine
            .transition(&request.id, "approved", &outsider, TransitionOptions::approve())
            .await;
        assert!(matches!(
            result,
            Err(LifecycleError::Forbidden(AuthorizationError::TenantMismatch { .. }))
        ));

        let admin = Actor::new("U-admin", roles::ADMIN);
        let approved = harness
            .engine
            .transition(&request.id, "approved", &admin, TransitionOptions::approve())
            .await;
        assert!(approved.is_ok());
    }

    #[tokio::test]
    async fn unknown_roles_are_denied() {
        let harness = harness();
        let request = submitted_request(&harness).await;
        let stranger = Actor::new("U-x", "superuser").with_company("ACME");

        let result = harness
            .engine
            .transition(&request.id, "approved", &stranger, TransitionOptions::approve())
            .await;
        assert!(matches!(
            result,
            Err(LifecycleError::Forbidden(AuthorizationError::MissingPermission { .. }))
        ));
        assert!(matches!(
            harness.engine.get(&request.id, &stranger).await,
            Err(LifecycleError::Forbidden(AuthorizationError::NotOwner { .. }))
        ));
    }

    #[tokio::test]
    async fn missing_request_is_not_found() {
        let harness = harness();
        let id = RequestId("TR-missing".to_string());
        let result =
            harness.engine.transition(&id, "approved", &approver(), TransitionOptions::approve()).await;
        assert_eq!(result.err(), Some(LifecycleError::NotFound(id)));
    }

    #[tokio::test]
    async fn get_enforces_visibility() {
        let harness = harness();
        let request = submitted_request(&harness).await;

        assert!(harness.engine.get(&request.id, &employee()).await.is_ok());
        assert!(harness.engine.get(&request.id, &approver()).await.is_ok());
        assert!(harness.engine.get(&request.id, &agent()).await.is_ok());

        let colleague = Actor::new("U-emp2", roles::EMPLOYEE).with_company("ACME");
        assert!(matches!(
            harness.engine.get(&request.id, &colleague).await,
            Err(LifecycleError::Forbidden(_))
        ));
        let outsider = Actor::new("U-globex", roles::CORPORATE_CLIENT).with_company("GLOBEX");
        assert!(harness.engine.get(&request.id, &outsider).await.is_err());
    }

    #[tokio::test]
    async fn happy_path_writes_one_entry_per_transition_in_order() {
        let harness = harness();
        let created = harness
            .engine
            .create(draft(), &employee(), CreateOptions::default())
            .await
            .expect("create")
            .request;

        let steps = [
            ("submitted", employee(), TransitionOptions::default()),
            ("approved", approver(), TransitionOptions::approve()),
            ("fulfilled", agent(), TransitionOptions::default()),
            ("completed", agent(), TransitionOptions::default()),
        ];
        let mut last = created.clone();
        for (target, actor, options) in steps {
            last = harness
                .engine
                .transition(&created.id, target, &actor, options)
                .await
                .unwrap_or_else(|error| panic!("{target}: {error}"))
                .request;
        }

        assert_eq!(last.status, RequestStatus::Completed);
        assert!(last.status.is_terminal());
        assert_eq!(last.version, 5);

        let transitions: Vec<_> = entries_for(&harness, &created.id)
            .await
            .into_iter()
            .filter(|entry| entry.action != AuditAction::Create)
            .map(|entry| (entry.from_status, entry.to_status, entry.action))
            .collect();
        assert_eq!(
            transitions,
            vec![
                (Some(RequestStatus::Draft), Some(RequestStatus::Submitted), AuditAction::StatusChanged),
                (Some(RequestStatus::Submitted), Some(RequestStatus::Approved), AuditAction::Approved),
                (Some(RequestStatus::Approved), Some(RequestStatus::Fulfilled), AuditAction::StatusChanged),
                (Some(RequestStatus::Fulfilled), Some(RequestStatus::Completed), AuditAction::StatusChanged),
            ]
        );

        let reopened = harness
            .engine
            .transition(&created.id, "cancelled", &agent(), TransitionOptions::default())
            .await;
        assert!(matches!(reopened, Err(LifecycleError::InvalidTransition { .. })));
    }

    /// Holds every reader at a barrier so two transitions observe the same status.
    struct RacingRequestStore {
        inner: InMemoryRequestStore,
        barrier: Barrier,
    }

    #[async_trait]
    impl RequestStore for RacingRequestStore {
        async fn find_by_id(&self, id: &RequestId) -> Result<Option<TravelRequest>, StoreError> {
            let found = self.inner.find_by_id(id).await;
            self.barrier.wait().await;
            found
        }

        async fn insert(&self, request: TravelRequest) -> Result<(), StoreError> {
            self.inner.insert(request).await
        }

        async fn compare_and_swap(
            &self,
            expected: RequestStatus,
            request: TravelRequest,
        ) -> Result<SwapOutcome, StoreError> {
            self.inner.compare_and_swap(expected, request).await
        }
    }

    #[tokio::test]
    async fn concurrent_approvals_yield_one_success_and_one_conflict() {
        let inner = InMemoryRequestStore::default();
        let seeded = harness();
        let request = submitted_request(&seeded).await;
        inner.insert(request.clone()).await.expect("seed");

        let audit = InMemoryAuditStore::default();
        let engine = engine_with(
            Arc::new(RacingRequestStore { inner: inner.clone(), barrier: Barrier::new(2) }),
            Arc::new(audit.clone()),
            Arc::new(InMemoryNotificationSink::default()),
        );
        let approver = approver();
        let admin = Actor::new("U-admin", roles::ADMIN);

        let (first, second) = tokio::join!(
            engine.transition(&request.id, "approved", &approver, TransitionOptions::approve()),
            engine.transition(&request.id, "approved", &admin, TransitionOptions::approve()),
        );

        let outcomes = [first, second];
        let successes = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
        let conflicts = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Err(LifecycleError::Conflict { .. })))
            .count();
        assert_eq!((successes, conflicts), (1, 1));
        assert_eq!(audit.entries().await.len(), 1);
    }

    struct FailingAuditStore;

    #[async_trait]
    impl AuditStore for FailingAuditStore {
        async fn append(&self, _entry: AuditEntry) -> Result<(), StoreError> {
            Err(StoreError::Backend("audit table is read-only".to_string()))
        }

        async fn query(
            &self,
            _filter: &AuditFilter,
            _page: Pagination,
        ) -> Result<Vec<AuditEntry>, StoreError> {
            Ok(Vec::new())
        }

        async fn count(&self, _filter: &AuditFilter) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn publish(&self, _event: DomainEvent) -> Result<PublishOutcome, NotificationError> {
            Err(NotificationError::Delivery("broker offline".to_string()))
        }
    }

    #[tokio::test]
    async fn side_channel_failures_do_not_revert_the_transition() {
        let requests = InMemoryRequestStore::default();
        let engine = engine_with(
            Arc::new(requests.clone()),
            Arc::new(FailingAuditStore),
            Arc::new(FailingSink),
        );
        let request = engine
            .create(draft(), &employee(), CreateOptions { submit_immediately: true, ..Default::default() })
            .await
            .expect("create commits despite audit failure")
            .request;

        let receipt = engine
            .transition(&request.id, "approved", &approver(), TransitionOptions::approve())
            .await
            .expect("transition commits");

        assert!(matches!(receipt.audit, SideEffect::Failed(ref reason) if reason.contains("read-only")));
        assert!(matches!(receipt.notification, SideEffect::Failed(ref reason) if reason.contains("offline")));
        let stored = requests.find_by_id(&request.id).await.expect("find").expect("row");
        assert_eq!(stored.status, RequestStatus::Approved);
    }
}

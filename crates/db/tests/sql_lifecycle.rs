use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use waypoint_core::audit::{AuditFilter, AuditLog, Pagination};
use waypoint_core::authz::{roles, AuthorizationGate};
use waypoint_core::booking::{
    BookingConfig, BookingExecutor, BookingRequest, PolicyContext, SandboxProvider,
};
use waypoint_core::domain::actor::Actor;
use waypoint_core::domain::audit::{AuditAction, ENTITY_TRAVEL_REQUEST};
use waypoint_core::domain::booking::{BookingKind, IdempotencyKey};
use waypoint_core::domain::request::{NewTravelRequest, RequestStatus, RequestType};
use waypoint_core::errors::{BookingError, LifecycleError};
use waypoint_core::lifecycle::{CreateOptions, LifecycleConfig, LifecycleEngine, TransitionOptions};
use waypoint_db::{
    connect_with_settings, migrations, DbPool, SqlAuditStore, SqlBookingStore, SqlOutboxSink,
    SqlRequestStore,
};

struct SqlStack {
    pool: DbPool,
    engine: LifecycleEngine,
    bookings: BookingExecutor,
    audit: AuditLog,
    outbox: SqlOutboxSink,
}

async fn sql_stack() -> SqlStack {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("run migrations");

    let gate = AuthorizationGate::default();
    let outbox = SqlOutboxSink::new(pool.clone());
    let audit = AuditLog::new(
        Arc::new(SqlAuditStore::new(pool.clone())),
        gate.clone(),
        Duration::from_secs(5),
    );
    let engine = LifecycleEngine::new(
        Arc::new(SqlRequestStore::new(pool.clone())),
        audit.clone(),
        Arc::new(outbox.clone()),
        gate.clone(),
        LifecycleConfig::default(),
    );
    let bookings = BookingExecutor::new(
        Arc::new(SqlBookingStore::new(pool.clone())),
        Arc::new(SqlRequestStore::new(pool.clone())),
        audit.clone(),
        Arc::new(outbox.clone()),
        gate,
        BookingConfig::default(),
    )
    .with_provider(Arc::new(SandboxProvider));

    SqlStack { pool, engine, bookings, audit, outbox }
}

fn draft() -> NewTravelRequest {
    NewTravelRequest {
        request_type: RequestType::Package,
        destination: "Cape Town".to_string(),
        start_date: NaiveDate::from_ymd_opt(2027, 1, 12).expect("date"),
        end_date: NaiveDate::from_ymd_opt(2027, 1, 20).expect("date"),
        budget: Decimal::new(780_000, 2),
    }
}

#[tokio::test]
async fn happy_path_persists_four_ordered_transition_entries() {
    let stack = sql_stack().await;
    let owner = Actor::new("U-owner", roles::EMPLOYEE).with_company("ACME");
    let approver = Actor::new("U-approver", roles::CORPORATE_CLIENT).with_company("ACME");
    let agent = Actor::new("U-agent", roles::TRAVEL_AGENT);

    let created = stack
        .engine
        .create(draft(), &owner, CreateOptions::default())
        .await
        .expect("create")
        .request;
    let id = created.id.clone();

    stack
        .engine
        .transition(&id, "pending", &owner, TransitionOptions::default())
        .await
        .expect("submit");
    let approved = stack
        .engine
        .transition(&id, "approved", &approver, TransitionOptions::approve())
        .await
        .expect("approve");
    assert!(approved.audit.is_delivered());
    assert_eq!(approved.request.approved_by, Some(approver.id.clone()));

    stack
        .engine
        .transition(&id, "booked", &agent, TransitionOptions::default())
        .await
        .expect("fulfil");
    let done = stack
        .engine
        .transition(&id, "completed", &agent, TransitionOptions::default())
        .await
        .expect("complete")
        .request;

    assert_eq!(done.status, RequestStatus::Completed);
    assert!(done.status.is_terminal());

    let page = stack
        .audit
        .query(&AuditFilter::for_entity(ENTITY_TRAVEL_REQUEST, id.0.clone()), Pagination::default())
        .await
        .expect("query audit");
    let transitions: Vec<(Option<RequestStatus>, Option<RequestStatus>)> = page
        .items
        .iter()
        .filter(|entry| entry.action != AuditAction::Create)
        .map(|entry| (entry.from_status, entry.to_status))
        .collect();

    assert_eq!(
        transitions,
        vec![
            (Some(RequestStatus::Draft), Some(RequestStatus::Submitted)),
            (Some(RequestStatus::Submitted), Some(RequestStatus::Approved)),
            (Some(RequestStatus::Approved), Some(RequestStatus::Fulfilled)),
            (Some(RequestStatus::Fulfilled), Some(RequestStatus::Completed)),
        ]
    );

    let pending = stack.outbox.pending(50).await.expect("outbox");
    assert!(pending.iter().any(|record| record.event.dedupe_key == format!("review-thread:{id}")));

    stack.pool.close().await;
}

#[tokio::test]
async fn racing_approval_and_rejection_leave_one_decision() {
    let stack = sql_stack().await;
    let owner = Actor::new("U-owner", roles::EMPLOYEE).with_company("ACME");
    let approver = Actor::new("U-approver", roles::CORPORATE_CLIENT).with_company("ACME");
    let other = Actor::new("U-other", roles::CORPORATE_CLIENT).with_company("ACME");

    let id = stack
        .engine
        .create(
            draft(),
            &owner,
            CreateOptions { submit_immediately: true, ..CreateOptions::default() },
        )
        .await
        .expect("create")
        .request
        .id;

    let (left, right) = tokio::join!(
        stack.engine.transition(&id, "approved", &approver, TransitionOptions::approve()),
        stack.engine.transition(&id, "rejected", &other, TransitionOptions::reject(None)),
    );

    let successes = [left.is_ok(), right.is_ok()].into_iter().filter(|ok| *ok).count();
    assert_eq!(successes, 1);
    let loser = if left.is_err() { left.err() } else { right.err() };
    assert!(matches!(
        loser,
        Some(LifecycleError::Conflict { .. }) | Some(LifecycleError::InvalidTransition { .. })
    ));

    let decisions = stack
        .audit
        .query(&AuditFilter::for_entity(ENTITY_TRAVEL_REQUEST, id.0.clone()), Pagination::default())
        .await
        .expect("query audit")
        .items
        .into_iter()
        .filter(|entry| matches!(entry.action, AuditAction::Approved | AuditAction::Rejected))
        .count();
    assert_eq!(decisions, 1);

    stack.pool.close().await;
}

#[tokio::test]
async fn booking_replay_is_served_from_the_database() {
    let stack = sql_stack().await;
    let agent = Actor::new("U-agent", roles::TRAVEL_AGENT);
    let key = IdempotencyKey::parse("flight:TR-9:offer-77").expect("key");
    let request = BookingRequest {
        kind: BookingKind::Flight,
        offer_id: "offer-77".to_string(),
        provider: None,
        traveler_ids: vec!["T-1".to_string()],
        request_id: None,
        approved_by: None,
    };

    let first = stack
        .bookings
        .book(request.clone(), key.clone(), PolicyContext::new(agent.clone(), "corr-1"))
        .await
        .expect("first booking");
    let second = stack
        .bookings
        .book(request, key, PolicyContext::new(agent, "corr-2"))
        .await
        .expect("replayed booking");

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.attempt.external_id, second.attempt.external_id);
    assert_eq!(first.attempt.confirmation_code, second.attempt.confirmation_code);
    assert_eq!(second.attempt.attempt_count, 1);

    stack.pool.close().await;
}

#[tokio::test]
async fn agent_bookings_for_a_tenant_request_wait_for_its_approval() {
    let stack = sql_stack().await;
    let owner = Actor::new("U-owner", roles::EMPLOYEE).with_company("ACME");
    let approver = Actor::new("U-approver", roles::CORPORATE_CLIENT).with_company("ACME");
    let agent = Actor::new("U-agent", roles::TRAVEL_AGENT);

    let id = stack
        .engine
        .create(
            draft(),
            &owner,
            CreateOptions { submit_immediately: true, ..CreateOptions::default() },
        )
        .await
        .expect("create")
        .request
        .id;
    let request = BookingRequest {
        kind: BookingKind::Flight,
        offer_id: "offer-CPT-3".to_string(),
        provider: None,
        traveler_ids: vec!["U-owner".to_string()],
        request_id: Some(id.clone()),
        approved_by: None,
    };
    let key = IdempotencyKey::parse("flight:offer-CPT-3").expect("key");

    let refused = stack
        .bookings
        .book(request.clone(), key.clone(), PolicyContext::new(agent.clone(), "corr-early"))
        .await;
    assert_eq!(refused, Err(BookingError::ApprovalRequired { company_id: "ACME".to_string() }));

    stack
        .engine
        .transition(&id, "approved", &approver, TransitionOptions::approve())
        .await
        .expect("approve");

    let booked = stack
        .bookings
        .book(request, key, PolicyContext::new(agent, "corr-late"))
        .await
        .expect("booking after approval");
    assert_eq!(booked.attempt.company_id.as_ref().map(|c| c.0.as_str()), Some("ACME"));
    assert_eq!(booked.attempt.approved_by, Some(approver.id.clone()));
    assert!(booked.attempt.approval_required);

    stack.pool.close().await;
}

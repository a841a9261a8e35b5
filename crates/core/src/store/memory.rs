use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::audit::{AuditFilter, Pagination};
use crate::domain::audit::AuditEntry;
use crate::domain::booking::{AttemptResult, BookingAttempt, IdempotencyKey};
use crate::domain::request::{RequestId, RequestStatus, TravelRequest};
use crate::errors::StoreError;

use super::{AuditStore, BookingStore, ClaimOutcome, RequestStore, SwapOutcome};

#[derive(Clone, Default)]
pub struct InMemoryRequestStore {
    requests: Arc<RwLock<HashMap<String, TravelRequest>>>,
}

#[async_trait::async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<TravelRequest>, StoreError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id.0).cloned())
    }

    async fn insert(&self, request: TravelRequest) -> Result<(), StoreError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id.0) {
            return Err(StoreError::Duplicate(request.id.0));
        }
        requests.insert(request.id.0.clone(), request);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        expected: RequestStatus,
        request: TravelRequest,
    ) -> Result<SwapOutcome, StoreError> {
        let mut requests = self.requests.write().await;
        match requests.get_mut(&request.id.0) {
            Some(stored) if stored.status == expected => {
                *stored = request;
                Ok(SwapOutcome::Applied)
            }
            _ => Ok(SwapOutcome::Stale),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAuditStore {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryAuditStore {
    /// Every entry in insertion order.
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait::async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if entries.iter().any(|existing| existing.id == entry.id) {
            return Err(StoreError::Duplicate(entry.id.0));
        }
        entries.push(entry);
        Ok(())
    }

    async fn query(
        &self,
        filter: &AuditFilter,
        page: Pagination,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let entries = self.entries.read().await;
        let mut matching: Vec<&AuditEntry> =
            entries.iter().filter(|entry| filter.matches(entry)).collect();
        // stable sort keeps insertion order for equal timestamps
        matching.sort_by_key(|entry| entry.created_at);

        let offset = usize::try_from(page.offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(page.limit).unwrap_or(usize::MAX);
        Ok(matching.into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn count(&self, filter: &AuditFilter) -> Result<u64, StoreError> {
        let entries = self.entries.read().await;
        let count = entries.iter().filter(|entry| filter.matches(entry)).count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBookingStore {
    attempts: Arc<RwLock<HashMap<String, BookingAttempt>>>,
}

#[async_trait::async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn find(&self, key: &IdempotencyKey) -> Result<Option<BookingAttempt>, StoreError> {
        let attempts = self.attempts.read().await;
        Ok(attempts.get(key.as_str()).cloned())
    }

    async fn claim(
        &self,
        candidate: BookingAttempt,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut attempts = self.attempts.write().await;
        let Some(existing) = attempts.get_mut(candidate.idempotency_key.as_str()) else {
            let mut fresh = candidate;
            fresh.result = AttemptResult::Pending;
            fresh.attempt_count = 1;
            attempts.insert(fresh.idempotency_key.as_str().to_string(), fresh.clone());
            return Ok(ClaimOutcome::Claimed(fresh));
        };

        let rearmable = match existing.result {
            AttemptResult::Success => false,
            AttemptResult::Failed => true,
            AttemptResult::Pending => existing.updated_at < stale_before,
        };
        if !rearmable {
            return Ok(ClaimOutcome::Existing(existing.clone()));
        }

        let rearmed = BookingAttempt {
            result: AttemptResult::Pending,
            attempt_count: existing.attempt_count.saturating_add(1),
            last_error: existing.last_error.take(),
            created_at: existing.created_at,
            updated_at: candidate.updated_at,
            ..candidate
        };
        *existing = rearmed.clone();
        Ok(ClaimOutcome::Claimed(rearmed))
    }

    async fn settle(&self, attempt: BookingAttempt) -> Result<(), StoreError> {
        let mut attempts = self.attempts.write().await;
        match attempts.get_mut(attempt.idempotency_key.as_str()) {
            Some(stored)
                if stored.result == AttemptResult::Pending
                    && stored.attempt_count == attempt.attempt_count =>
            {
                *stored = attempt;
                Ok(())
            }
            Some(_) => Err(StoreError::ClaimLost(attempt.idempotency_key.to_string())),
            None => Err(StoreError::Backend(format!(
                "booking attempt `{}` was settled without a claim",
                attempt.idempotency_key
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, Utc};
    use rust_decimal::Decimal;

    use crate::audit::{AuditFilter, Pagination};
    use crate::domain::actor::ActorId;
    use crate::domain::audit::{AuditAction, AuditEntry, ENTITY_TRAVEL_REQUEST};
    use crate::domain::booking::{AttemptResult, BookingAttempt, BookingKind, IdempotencyKey};
    use crate::domain::request::{RequestId, RequestStatus, RequestType, TravelRequest};
    use crate::errors::StoreError;
    use crate::store::{
        AuditStore, BookingStore, ClaimOutcome, InMemoryAuditStore, InMemoryBookingStore,
        InMemoryRequestStore, RequestStore, SwapOutcome,
    };

    fn request(status: RequestStatus) -> TravelRequest {
        let now = Utc::now();
        TravelRequest {
            id: RequestId("TR-1".to_string()),
            owner_id: ActorId("U-1".to_string()),
            company_id: None,
            request_type: RequestType::Flight,
            status,
            destination: "Lisbon".to_string(),
            start_date: NaiveDate::from_ymd_opt(2026, 11, 2).expect("date"),
            end_date: NaiveDate::from_ymd_opt(2026, 11, 6).expect("date"),
            budget: Decimal::new(150_000, 2),
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn attempt(key: &str) -> BookingAttempt {
        let now = Utc::now();
        BookingAttempt {
            idempotency_key: IdempotencyKey::parse(key).expect("key"),
            kind: BookingKind::Flight,
            offer_id: "offer-1".to_string(),
            provider: "sandbox".to_string(),
            request_id: None,
            company_id: None,
            traveler_ids: vec!["T-1".to_string()],
            approval_required: false,
            approved_by: None,
            result: AttemptResult::Pending,
            external_id: None,
            confirmation_code: None,
            attempt_count: 0,
            last_error: None,
            payload_hash: "hash".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_expected_status() {
        let store = InMemoryRequestStore::default();
        store.insert(request(RequestStatus::Submitted)).await.expect("insert");

        let approved =
            TravelRequest { status: RequestStatus::Approved, ..request(RequestStatus::Submitted) };
        let cancelled =
            TravelRequest { status: RequestStatus::Cancelled, ..request(RequestStatus::Submitted) };

        let first =
            store.compare_and_swap(RequestStatus::Submitted, approved).await.expect("cas");
        let second =
            store.compare_and_swap(RequestStatus::Submitted, cancelled).await.expect("cas");

        assert_eq!(first, SwapOutcome::Applied);
        assert_eq!(second, SwapOutcome::Stale);
        let stored = store.find_by_id(&RequestId("TR-1".to_string())).await.expect("find");
        assert_eq!(stored.map(|request| request.status), Some(RequestStatus::Approved));
    }

    #[tokio::test]
    async fn duplicate_insert_is_reported() {
        let store = InMemoryRequestStore::default();
        store.insert(request(RequestStatus::Draft)).await.expect("insert");
        let duplicate = store.insert(request(RequestStatus::Draft)).await;
        assert_eq!(duplicate, Err(StoreError::Duplicate("TR-1".to_string())));
    }

    #[tokio::test]
    async fn audit_query_pages_in_creation_order() {
        let store = InMemoryAuditStore::default();
        for index in 0..5 {
            let mut entry = AuditEntry::new(
                ENTITY_TRAVEL_REQUEST,
                format!("TR-{index}"),
                AuditAction::StatusChanged,
                "corr",
            );
            entry.created_at = Utc::now() - Duration::minutes(10 - index);
            store.append(entry).await.expect("append");
        }

        let page = store
            .query(&AuditFilter::default(), Pagination::new(Some(2), Some(1)))
            .await
            .expect("query");
        let ids: Vec<_> = page.iter().map(|entry| entry.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["TR-1", "TR-2"]);
        assert_eq!(store.count(&AuditFilter::default()).await.expect("count"), 5);
    }

    #[tokio::test]
    async fn claim_refuses_pending_and_successful_keys() {
        let store = InMemoryBookingStore::default();
        let long_ago = Utc::now() - Duration::hours(1);

        let claimed = store.claim(attempt("bk-1"), long_ago).await.expect("claim");
        assert!(matches!(claimed, ClaimOutcome::Claimed(ref a) if a.attempt_count == 1));

        let contended = store.claim(attempt("bk-1"), long_ago).await.expect("claim");
        assert!(matches!(
            contended,
            ClaimOutcome::Existing(ref a) if a.result == AttemptResult::Pending
        ));

        let mut success = attempt("bk-1");
        success.result = AttemptResult::Success;
        success.external_id = Some("PNR-1".to_string());
        success.attempt_count = 1;
        store.settle(success).await.expect("settle");

        let after =
            store.claim(attempt("bk-1"), Utc::now() + Duration::hours(1)).await.expect("claim");
        assert!(matches!(
            after,
            ClaimOutcome::Existing(ref a) if a.result == AttemptResult::Success
        ));
    }

    #[tokio::test]
    async fn claim_rearms_failed_and_stale_pending_attempts() {
        let store = InMemoryBookingStore::default();
        store.claim(attempt("bk-2"), Utc::now()).await.expect("claim");

        let mut failed = attempt("bk-2");
        failed.result = AttemptResult::Failed;
        failed.last_error = Some("sold out".to_string());
        failed.attempt_count = 1;
        store.settle(failed).await.expect("settle");

        let retried =
            store.claim(attempt("bk-2"), Utc::now() - Duration::hours(1)).await.expect("claim");
        let ClaimOutcome::Claimed(retried) = retried else {
            panic!("failed attempt should be re-armed");
        };
        assert_eq!(retried.attempt_count, 2);
        assert_eq!(retried.result, AttemptResult::Pending);
        assert_eq!(retried.last_error.as_deref(), Some("sold out"));

        // still pending; only a stale cutoff in the future lets a new caller steal it
        let stolen =
            store.claim(attempt("bk-2"), Utc::now() + Duration::seconds(1)).await.expect("claim");
        assert!(matches!(stolen, ClaimOutcome::Claimed(ref a) if a.attempt_count == 3));
    }

    #[tokio::test]
    async fn settle_never_overwrites_success() {
        let store = InMemoryBookingStore::default();
        store.claim(attempt("bk-3"), Utc::now()).await.expect("claim");

        let mut success = attempt("bk-3");
        success.result = AttemptResult::Success;
        success.confirmation_code = Some("ABC123".to_string());
        success.attempt_count = 1;
        store.settle(success).await.expect("settle");

        let mut failed = attempt("bk-3");
        failed.result = AttemptResult::Failed;
        failed.attempt_count = 1;
        assert_eq!(
            store.settle(failed).await,
            Err(StoreError::ClaimLost("bk-3".to_string()))
        );

        let key = IdempotencyKey::parse("bk-3").expect("key");
        let stored = store.find(&key).await.expect("find");
        assert_eq!(stored.and_then(|a| a.confirmation_code), Some("ABC123".to_string()));
    }

    #[tokio::test]
    async fn late_settle_from_a_superseded_claim_is_fenced() {
        let store = InMemoryBookingStore::default();
        let ClaimOutcome::Claimed(original) =
            store.claim(attempt("bk-5"), Utc::now()).await.expect("claim")
        else {
            panic!("first claim should succeed");
        };
        let ClaimOutcome::Claimed(takeover) =
            store.claim(attempt("bk-5"), Utc::now() + Duration::seconds(1)).await.expect("claim")
        else {
            panic!("stale pending claim should be taken over");
        };
        assert_eq!(takeover.attempt_count, 2);

        let mut late = original;
        late.result = AttemptResult::Failed;
        late.last_error = Some("timed out".to_string());
        assert_eq!(store.settle(late).await, Err(StoreError::ClaimLost("bk-5".to_string())));

        let key = IdempotencyKey::parse("bk-5").expect("key");
        let stored = store.find(&key).await.expect("find").expect("attempt");
        assert_eq!(stored.result, AttemptResult::Pending);
        assert_eq!(stored.attempt_count, 2);

        // the live claim still settles, and a second settle is refused
        let mut done = takeover;
        done.result = AttemptResult::Success;
        done.external_id = Some("PNR-5".to_string());
        store.settle(done.clone()).await.expect("settle by current claim");
        assert_eq!(store.settle(done).await, Err(StoreError::ClaimLost("bk-5".to_string())));
    }

    #[tokio::test]
    async fn settle_without_claim_is_an_error() {
        let store = InMemoryBookingStore::default();
        assert!(matches!(store.settle(attempt("bk-4")).await, Err(StoreError::Backend(_))));
    }
}

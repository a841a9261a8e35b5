//! Persistence ports consumed by the lifecycle engine, audit writer and
//! booking executor. SQL implementations live in `waypoint-db`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::audit::{AuditFilter, Pagination};
use crate::domain::audit::AuditEntry;
use crate::domain::booking::{BookingAttempt, IdempotencyKey};
use crate::domain::request::{RequestId, RequestStatus, TravelRequest};
use crate::errors::StoreError;

pub mod memory;

pub use memory::{InMemoryAuditStore, InMemoryBookingStore, InMemoryRequestStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapOutcome {
    Applied,
    /// The stored status no longer matched the expected value; nothing was written.
    Stale,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the key and must call the provider.
    Claimed(BookingAttempt),
    /// Another attempt holds the key (in flight or settled).
    Existing(BookingAttempt),
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<TravelRequest>, StoreError>;

    async fn insert(&self, request: TravelRequest) -> Result<(), StoreError>;

    /// Writes `request` only when the stored status still equals `expected`.
    async fn compare_and_swap(
        &self,
        expected: RequestStatus,
        request: TravelRequest,
    ) -> Result<SwapOutcome, StoreError>;
}

/// Append-only. There is deliberately no update or delete.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError>;

    async fn query(
        &self,
        filter: &AuditFilter,
        page: Pagination,
    ) -> Result<Vec<AuditEntry>, StoreError>;

    async fn count(&self, filter: &AuditFilter) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find(&self, key: &IdempotencyKey) -> Result<Option<BookingAttempt>, StoreError>;

    /// Atomically reserves the key. Inserts `candidate` as pending when the key
    /// is new; re-arms a failed attempt, or a pending one last touched before
    /// `stale_before`; otherwise returns the existing attempt untouched.
    async fn claim(
        &self,
        candidate: BookingAttempt,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Settles the pending claim identified by `attempt.attempt_count`. When
    /// the stored row has moved on (settled, or re-armed by a newer claim) the
    /// write is refused with [`StoreError::ClaimLost`].
    async fn settle(&self, attempt: BookingAttempt) -> Result<(), StoreError>;
}

/// Bounds a storage future so no call blocks indefinitely.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    future: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

//! Allowed status transitions and the legacy status vocabulary.

use crate::domain::request::RequestStatus;
use crate::errors::LifecycleError;

/// Legacy and alternate spellings still sent by older clients. The flag marks
/// aliases that imply an explicit rejection.
const STATUS_ALIASES: [(&str, RequestStatus, bool); 6] = [
    ("pending", RequestStatus::Submitted, false),
    ("rejected", RequestStatus::Cancelled, true),
    ("booked", RequestStatus::Fulfilled, false),
    ("canceled", RequestStatus::Cancelled, false),
    ("done", RequestStatus::Completed, false),
    ("closed", RequestStatus::Completed, false),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedStatus {
    pub status: RequestStatus,
    pub implies_reject: bool,
}

pub fn allowed_targets(from: RequestStatus) -> &'static [RequestStatus] {
    use RequestStatus::{Approved, Cancelled, Completed, Draft, Fulfilled, Submitted};

    match from {
        Draft => &[Submitted, Cancelled],
        Submitted => &[Approved, Cancelled],
        Approved => &[Fulfilled, Cancelled],
        Fulfilled => &[Completed, Cancelled],
        Completed | Cancelled => &[],
    }
}

pub fn can_transition(from: RequestStatus, to: RequestStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// Same as [`can_transition`] for unvalidated input. Anything that does not
/// resolve to a status is simply not allowed.
pub fn can_transition_raw(from: &str, to: &str) -> bool {
    match (normalize_status(from), normalize_status(to)) {
        (Ok(from), Ok(to)) => can_transition(from.status, to.status),
        _ => false,
    }
}

pub fn normalize_status(raw: &str) -> Result<ResolvedStatus, LifecycleError> {
    let key = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    if let Some(status) = RequestStatus::parse(&key) {
        return Ok(ResolvedStatus { status, implies_reject: false });
    }
    STATUS_ALIASES
        .iter()
        .find(|(alias, _, _)| *alias == key)
        .map(|(_, status, implies_reject)| ResolvedStatus {
            status: *status,
            implies_reject: *implies_reject,
        })
        .ok_or_else(|| LifecycleError::InvalidStatus { value: raw.to_string() })
}

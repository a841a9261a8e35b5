use thiserror::Error;

use crate::authz::AuthorizationError;
use crate::domain::booking::{IdempotencyKey, InvalidIdempotencyKey};
use crate::domain::request::{RequestId, RequestStatus};
use crate::lifecycle::TransitionAction;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("stored record could not be decoded: {0}")]
    Decode(String),
    #[error("record already exists: {0}")]
    Duplicate(String),
    #[error("storage call `{operation}` exceeded {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },
    /// The write was fenced off: a newer claim owns the record.
    #[error("claim on `{0}` was superseded by a newer attempt")]
    ClaimLost(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("travel request `{0}` was not found")]
    NotFound(RequestId),
    #[error("unknown status `{value}`")]
    InvalidStatus { value: String },
    #[error("cannot transition request from `{from}` to `{to}`")]
    InvalidTransition { from: RequestStatus, to: RequestStatus },
    #[error("action `{action}` cannot target status `{to}`")]
    ActionMismatch { action: TransitionAction, to: RequestStatus },
    #[error("request validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Forbidden(#[from] AuthorizationError),
    #[error("travel request `{id}` changed concurrently (expected `{expected}`); reload and retry")]
    Conflict { id: RequestId, expected: RequestStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider `{provider}` rejected the booking: {message}")]
    Rejected { provider: String, message: String },
    #[error("provider `{provider}` transport failure: {message}")]
    Transport { provider: String, message: String },
    #[error("provider `{provider}` did not answer within {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },
    #[error("provider `{provider}` returned no confirmation identifiers")]
    MissingConfirmation { provider: String },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BookingError {
    #[error("tenant `{company_id}` bookings require an approver")]
    ApprovalRequired { company_id: String },
    #[error("booking `{0}` is already in flight")]
    InFlight(IdempotencyKey),
    #[error("idempotency key `{0}` was already used for a different booking payload")]
    KeyReuse(IdempotencyKey),
    #[error(transparent)]
    InvalidKey(#[from] InvalidIdempotencyKey),
    #[error("booking validation failed: {0}")]
    Validation(String),
    #[error("travel request `{0}` was not found")]
    RequestNotFound(RequestId),
    #[error(transparent)]
    Forbidden(#[from] AuthorizationError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("unsupported export format `{0}` (expected json|csv)")]
    UnsupportedFormat(String),
    #[error("audit export serialization failed: {0}")]
    Serialization(String),
    #[error(transparent)]
    Forbidden(#[from] AuthorizationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Stable machine-readable codes. Clients branch on these, never on text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotFound,
    InvalidStatus,
    InvalidTransition,
    ActionMismatch,
    ValidationFailed,
    Unauthenticated,
    Forbidden,
    Conflict,
    ApprovalRequired,
    BookingInFlight,
    IdempotencyKeyReuse,
    ProviderError,
    ProviderTimeout,
    UnsupportedFormat,
    StoreUnavailable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidStatus => "INVALID_STATUS",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::ActionMismatch => "ACTION_MISMATCH",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Forbidden => "FORBIDDEN",
            Self::Conflict => "CONFLICT",
            Self::ApprovalRequired => "APPROVAL_REQUIRED",
            Self::BookingInFlight => "BOOKING_IN_FLIGHT",
            Self::IdempotencyKeyReuse => "IDEMPOTENCY_KEY_REUSE",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::ProviderTimeout => "PROVIDER_TIMEOUT",
            Self::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::InvalidStatus
            | Self::InvalidTransition
            | Self::ActionMismatch
            | Self::ValidationFailed
            | Self::UnsupportedFormat => 400,
            Self::Unauthenticated => 401,
            Self::Forbidden | Self::ApprovalRequired => 403,
            Self::Conflict | Self::BookingInFlight | Self::IdempotencyKeyReuse => 409,
            Self::ProviderError => 502,
            Self::StoreUnavailable => 503,
            Self::ProviderTimeout => 504,
            Self::Internal => 500,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct InterfaceError {
    pub code: ErrorCode,
    pub message: String,
    pub correlation_id: String,
}

impl InterfaceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), correlation_id: "unassigned".to_owned() }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn status(&self) -> u16 {
        self.code.http_status()
    }

    pub fn user_message(&self) -> &'static str {
        match self.code.http_status() {
            400 => "The request could not be processed. Check inputs and try again.",
            401 => "Sign in to continue.",
            403 => "You are not allowed to perform this action.",
            404 => "The requested record does not exist.",
            409 => "The record changed while you were working on it. Refresh and retry.",
            502 | 504 => "The booking provider did not confirm the booking. It is safe to retry.",
            503 => "The service is temporarily unavailable. Please retry shortly.",
            _ => "An unexpected internal error occurred.",
        }
    }
}

impl From<AuthorizationError> for InterfaceError {
    fn from(value: AuthorizationError) -> Self {
        let code = match value {
            AuthorizationError::Unauthenticated => ErrorCode::Unauthenticated,
            _ => ErrorCode::Forbidden,
        };
        Self::new(code, value.to_string())
    }
}

impl From<StoreError> for InterfaceError {
    fn from(value: StoreError) -> Self {
        let code = match value {
            StoreError::ClaimLost(_) => ErrorCode::Conflict,
            _ => ErrorCode::StoreUnavailable,
        };
        Self::new(code, value.to_string())
    }
}

impl From<LifecycleError> for InterfaceError {
    fn from(value: LifecycleError) -> Self {
        match value {
            LifecycleError::Forbidden(error) => error.into(),
            LifecycleError::Store(error) => error.into(),
            other => {
                let code = match &other {
                    LifecycleError::NotFound(_) => ErrorCode::NotFound,
                    LifecycleError::InvalidStatus { .. } => ErrorCode::InvalidStatus,
                    LifecycleError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
                    LifecycleError::ActionMismatch { .. } => ErrorCode::ActionMismatch,
                    LifecycleError::Validation(_) => ErrorCode::ValidationFailed,
                    LifecycleError::Conflict { .. } => ErrorCode::Conflict,
                    LifecycleError::Forbidden(_) | LifecycleError::Store(_) => ErrorCode::Internal,
                };
                Self::new(code, other.to_string())
            }
        }
    }
}

impl From<BookingError> for InterfaceError {
    fn from(value: BookingError) -> Self {
        match value {
            BookingError::Forbidden(error) => error.into(),
            BookingError::Store(error) => error.into(),
            other => {
                let code = match &other {
                    BookingError::ApprovalRequired { .. } => ErrorCode::ApprovalRequired,
                    BookingError::InFlight(_) => ErrorCode::BookingInFlight,
                    BookingError::KeyReuse(_) => ErrorCode::IdempotencyKeyReuse,
                    BookingError::RequestNotFound(_) => ErrorCode::NotFound,
                    BookingError::InvalidKey(_) | BookingError::Validation(_) => {
                        ErrorCode::ValidationFailed
                    }
                    BookingError::Provider(ProviderError::Timeout { .. }) => {
                        ErrorCode::ProviderTimeout
                    }
                    BookingError::Provider(_) => ErrorCode::ProviderError,
                    BookingError::Forbidden(_) | BookingError::Store(_) => ErrorCode::Internal,
                };
                Self::new(code, other.to_string())
            }
        }
    }
}

impl From<AuditError> for InterfaceError {
    fn from(value: AuditError) -> Self {
        match value {
            AuditError::Forbidden(error) => error.into(),
            AuditError::Store(error) => error.into(),
            AuditError::UnsupportedFormat(_) => {
                Self::new(ErrorCode::UnsupportedFormat, value.to_string())
            }
            AuditError::Serialization(_) => Self::new(ErrorCode::Internal, value.to_string()),
        }
    }
}

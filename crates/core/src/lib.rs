pub mod audit;
pub mod authz;
pub mod booking;
pub mod config;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod notify;
pub mod store;

pub use audit::{AuditFilter, AuditLog, ExportFormat, Page, Pagination, TenantScope};
pub use authz::{AuthorizationError, AuthorizationGate, Permission, RoleRegistry};
pub use booking::{
    BookingConfig, BookingExecutor, BookingProvider, BookingRequest, BookingResult, PolicyContext,
    SandboxProvider,
};
pub use domain::actor::{Actor, ActorId, CompanyId};
pub use domain::audit::{AuditAction, AuditEntry, AuditEntryId};
pub use domain::booking::{AttemptResult, BookingAttempt, BookingKind, IdempotencyKey};
pub use domain::request::{NewTravelRequest, RequestId, RequestStatus, RequestType, TravelRequest};
pub use errors::{
    AuditError, BookingError, ErrorCode, InterfaceError, LifecycleError, ProviderError, StoreError,
};
pub use lifecycle::{
    CreateOptions, LifecycleConfig, LifecycleEngine, SideEffect, TransitionAction,
    TransitionOptions, TransitionReceipt,
};
pub use notify::{DomainEvent, EventKind, NotificationError, NotificationSink, PublishOutcome};
pub use store::{AuditStore, BookingStore, ClaimOutcome, RequestStore, SwapOutcome};

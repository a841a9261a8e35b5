//! JSON API over the lifecycle engine, audit log and booking executor.
//!
//! Endpoints:
//! - `POST  /requests`        create a travel request (optionally submitted)
//! - `GET   /requests/{id}`   read a request visible to the caller
//! - `PATCH /requests/{id}`   move a request to another status
//! - `GET   /audit`           query (json) or export (csv) audit entries
//! - `POST  /flights/book`    idempotent flight booking
//! - `POST  /hotels/book`     idempotent hotel booking
//!
//! Identity is forwarded by the gateway in `x-actor-*` headers.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use waypoint_core::audit::{AuditFilter, AuditLog, ExportFormat, Pagination, TenantScope};
use waypoint_core::authz::AuthorizationError;
use waypoint_core::booking::{BookingExecutor, BookingRequest, PolicyContext};
use waypoint_core::domain::actor::{Actor, ActorId, CompanyId};
use waypoint_core::domain::audit::AuditAction;
use waypoint_core::domain::booking::{BookingKind, IdempotencyKey};
use waypoint_core::domain::request::{NewTravelRequest, RequestId, RequestType};
use waypoint_core::errors::{ErrorCode, InterfaceError};
use waypoint_core::lifecycle::{
    CreateOptions, LifecycleEngine, TransitionAction, TransitionOptions,
};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
pub const ACTOR_COMPANY_HEADER: &str = "x-actor-company";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct AppState {
    pub engine: LifecycleEngine,
    pub bookings: BookingExecutor,
    pub audit: AuditLog,
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateRequestBody {
    pub destination: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub budget: Decimal,
    #[serde(rename = "type")]
    pub request_type: String,
    #[serde(default)]
    pub submit: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionBody {
    pub status: Option<String>,
    pub action: Option<String>,
    pub actor_id: Option<String>,
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub action: Option<String>,
    pub tenant_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BookBody {
    pub offer_id: String,
    pub provider: Option<String>,
    pub idempotency_key: Option<String>,
    pub approved_by: Option<String>,
    #[serde(default)]
    pub traveler_ids: Vec<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail<'a> {
    code: &'static str,
    message: &'a str,
    correlation_id: &'a str,
}

/// An [`InterfaceError`] rendered as `{ "error": { code, message, correlation_id } }`.
#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl ApiError {
    fn new(error: impl Into<InterfaceError>, correlation_id: &str) -> Self {
        Self(error.into().with_correlation_id(correlation_id))
    }

    fn validation(message: impl Into<String>, correlation_id: &str) -> Self {
        Self::new(InterfaceError::new(ErrorCode::ValidationFailed, message), correlation_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let interface = self.0;
        let status =
            StatusCode::from_u16(interface.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(
                event_name = "api.request.failed",
                correlation_id = %interface.correlation_id,
                code = interface.code.as_str(),
                error = %interface.message,
                "request failed"
            );
        }

        let body = ErrorBody {
            error: ErrorDetail {
                code: interface.code.as_str(),
                message: &interface.message,
                correlation_id: &interface.correlation_id,
            },
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/requests", post(create_request))
        .route("/requests/{id}", get(get_request).patch(transition_request))
        .route("/audit", get(audit_log))
        .route("/flights/book", post(book_flight))
        .route("/hotels/book", post(book_hotel))
        .with_state(state)
}

fn correlation_id(headers: &HeaderMap) -> String {
    header_value(headers, CORRELATION_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| format!("corr-{}", Uuid::new_v4().simple()))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Reads the gateway-forwarded identity. Id and role are both required.
fn actor_from_headers(headers: &HeaderMap) -> Option<Actor> {
    let id = header_value(headers, ACTOR_ID_HEADER)?;
    let role = header_value(headers, ACTOR_ROLE_HEADER)?;
    let actor = Actor::new(id, role.to_ascii_lowercase());
    Some(match header_value(headers, ACTOR_COMPANY_HEADER) {
        Some(company) => actor.with_company(company),
        None => actor,
    })
}

fn json_body<T>(
    body: Result<Json<T>, JsonRejection>,
    correlation_id: &str,
) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::validation(rejection.body_text(), correlation_id))
}

fn require_identity(headers: &HeaderMap, correlation_id: &str) -> Result<Actor, ApiError> {
    actor_from_headers(headers)
        .ok_or_else(|| ApiError::new(AuthorizationError::Unauthenticated, correlation_id))
}

// ---------------------------------------------------------------------------
// Travel requests
// ---------------------------------------------------------------------------

async fn create_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateRequestBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let correlation_id = correlation_id(&headers);
    let actor = require_identity(&headers, &correlation_id)?;
    let body = json_body(body, &correlation_id)?;

    let Some(request_type) = RequestType::parse(&body.request_type) else {
        return Err(ApiError::validation(
            format!("unknown request type `{}`", body.request_type),
            &correlation_id,
        ));
    };
    let draft = NewTravelRequest {
        request_type,
        destination: body.destination,
        start_date: body.start_date,
        end_date: body.end_date,
        budget: body.budget,
    };

    let receipt = state
        .engine
        .create(
            draft,
            &actor,
            CreateOptions {
                submit_immediately: body.submit,
                correlation_id: Some(correlation_id.clone()),
            },
        )
        .await
        .map_err(|error| ApiError::new(error, &correlation_id))?;

    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let correlation_id = correlation_id(&headers);
    let actor = require_identity(&headers, &correlation_id)?;

    let request = state
        .engine
        .get(&RequestId(id), &actor)
        .await
        .map_err(|error| ApiError::new(error, &correlation_id))?;

    Ok(Json(request))
}

async fn transition_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<TransitionBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let correlation_id = correlation_id(&headers);
    let actor = require_identity(&headers, &correlation_id)?;
    let body = json_body(body, &correlation_id)?;

    if let Some(claimed) = body.actor_id.as_deref().map(str::trim) {
        if claimed != actor.id.0 {
            return Err(ApiError::validation(
                format!("actorId `{claimed}` does not match the authenticated actor"),
                &correlation_id,
            ));
        }
    }

    let action = match body.action.as_deref() {
        Some(raw) => match TransitionAction::parse(raw) {
            Some(action) => Some(action),
            None => {
                return Err(ApiError::validation(
                    format!("unknown action `{raw}` (expected approve|reject)"),
                    &correlation_id,
                ));
            }
        },
        None => None,
    };
    let target = match (body.status, action) {
        (Some(status), _) => status,
        (None, Some(TransitionAction::Approve)) => "approved".to_string(),
        (None, Some(TransitionAction::Reject)) => "rejected".to_string(),
        (None, None) => {
            return Err(ApiError::validation("status or action is required", &correlation_id));
        }
    };

    let options = TransitionOptions {
        action,
        rejection_reason: body.rejection_reason,
        correlation_id: Some(correlation_id.clone()),
    };
    let receipt = state
        .engine
        .transition(&RequestId(id), &target, &actor, options)
        .await
        .map_err(|error| ApiError::new(error, &correlation_id))?;

    Ok(Json(receipt))
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

async fn audit_log(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<AuditQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let actor = actor_from_headers(&headers);
    let Query(query) =
        query.map_err(|rejection| ApiError::validation(rejection.body_text(), &correlation_id))?;

    let format = ExportFormat::parse(query.format.as_deref().unwrap_or("json"))
        .map_err(|error| ApiError::new(error, &correlation_id))?;
    let action = match query.action.as_deref() {
        Some(raw) => Some(AuditAction::parse(raw).ok_or_else(|| {
            ApiError::validation(format!("unknown audit action `{raw}`"), &correlation_id)
        })?),
        None => None,
    };
    let filter = AuditFilter {
        entity_type: query.entity_type,
        entity_id: query.entity_id,
        action,
        tenant: query.tenant_id.map(|id| TenantScope::Tenant(CompanyId(id))).unwrap_or_default(),
    };
    let page = Pagination::new(query.limit, query.offset);

    match format {
        ExportFormat::Json => {
            let page = state
                .audit
                .query_as(actor.as_ref(), filter, page)
                .await
                .map_err(|error| ApiError::new(error, &correlation_id))?;
            Ok(Json(page).into_response())
        }
        ExportFormat::Csv => {
            let body = state
                .audit
                .export_as(actor.as_ref(), filter, page, format, &correlation_id)
                .await
                .map_err(|error| ApiError::new(error, &correlation_id))?;
            let disposition =
                format!("attachment; filename=\"audit-log.{}\"", format.file_extension());
            let mut response = body.into_response();
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
            if let Ok(value) = HeaderValue::from_str(&disposition) {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
            info!(
                event_name = "audit.export.served",
                correlation_id = %correlation_id,
                format = format.file_extension(),
                "audit export served"
            );
            Ok(response)
        }
    }
}

// ---------------------------------------------------------------------------
// Bookings
// ---------------------------------------------------------------------------

async fn book_flight(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<BookBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    book(state, BookingKind::Flight, headers, body).await
}

async fn book_hotel(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<BookBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    book(state, BookingKind::Hotel, headers, body).await
}

async fn book(
    state: AppState,
    kind: BookingKind,
    headers: HeaderMap,
    body: Result<Json<BookBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let correlation_id = correlation_id(&headers);
    let actor = require_identity(&headers, &correlation_id)?;
    let body = json_body(body, &correlation_id)?;

    // Header wins over body; a server key is minted only when neither is sent.
    let supplied = header_value(&headers, IDEMPOTENCY_KEY_HEADER).or(body.idempotency_key.as_deref());
    let key = match supplied {
        Some(raw) => IdempotencyKey::parse(raw)
            .map_err(|error| ApiError::validation(error.to_string(), &correlation_id))?,
        None => IdempotencyKey::generate(),
    };

    let request = BookingRequest {
        kind,
        offer_id: body.offer_id,
        provider: body.provider,
        traveler_ids: body.traveler_ids,
        request_id: body.request_id.map(RequestId),
        approved_by: body.approved_by.map(ActorId),
    };
    let result = state
        .bookings
        .book(request, key, PolicyContext::new(actor, correlation_id.clone()))
        .await
        .map_err(|error| ApiError::new(error, &correlation_id))?;

    let status = if result.replayed { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(result)))
}

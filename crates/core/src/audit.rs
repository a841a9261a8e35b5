use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::authz::{AuthorizationError, AuthorizationGate, Permission};
use crate::domain::actor::{Actor, CompanyId};
use crate::domain::audit::{AuditAction, AuditEntry, AuditEntryId, ENTITY_AUDIT_LOG};
use crate::errors::AuditError;
use crate::store::{with_timeout, AuditStore};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u64,
}

impl Pagination {
    /// Clamps the limit into `1..=MAX_PAGE_SIZE` and negative offsets to zero.
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        let limit = limit
            .map(|value| value.clamp(1, i64::from(MAX_PAGE_SIZE)))
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let offset = offset.and_then(|value| u64::try_from(value.max(0)).ok()).unwrap_or(0);
        Self { limit, offset }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self { limit: DEFAULT_PAGE_SIZE, offset: 0 }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantScope {
    #[default]
    Any,
    Tenant(CompanyId),
    /// Only entries that carry no tenant.
    Untenanted,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub action: Option<AuditAction>,
    pub tenant: TenantScope,
}

impl AuditFilter {
    pub fn for_entity(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        let tenant_ok = match &self.tenant {
            TenantScope::Any => true,
            TenantScope::Tenant(tenant) => entry.tenant_id.as_ref() == Some(tenant),
            TenantScope::Untenanted => entry.tenant_id.is_none(),
        };
        tenant_ok
            && self.entity_type.as_ref().map_or(true, |value| value == &entry.entity_type)
            && self.entity_id.as_ref().map_or(true, |value| value == &entry.entity_id)
            && self.action.map_or(true, |action| action == entry.action)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub limit: u32,
    pub offset: u64,
    pub total: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn parse(value: &str) -> Result<Self, AuditError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(AuditError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv; charset=utf-8",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

const CSV_HEADER: [&str; 11] = [
    "id",
    "created_at",
    "entity_type",
    "entity_id",
    "action",
    "from_status",
    "to_status",
    "actor_id",
    "tenant_id",
    "correlation_id",
    "metadata",
];

/// Audit log writer: append, filtered query and export.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    gate: AuthorizationGate,
    timeout: Duration,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>, gate: AuthorizationGate, timeout: Duration) -> Self {
        Self { store, gate, timeout }
    }

    pub async fn append(&self, entry: AuditEntry) -> Result<AuditEntryId, AuditError> {
        let id = entry.id.clone();
        with_timeout("audit.append", self.timeout, self.store.append(entry)).await?;
        Ok(id)
    }

    pub async fn query(
        &self,
        filter: &AuditFilter,
        page: Pagination,
    ) -> Result<Page<AuditEntry>, AuditError> {
        let items =
            with_timeout("audit.query", self.timeout, self.store.query(filter, page)).await?;
        let total = with_timeout("audit.count", self.timeout, self.store.count(filter)).await?;
        Ok(Page { items, limit: page.limit, offset: page.offset, total })
    }

    pub async fn export(
        &self,
        filter: &AuditFilter,
        page: Pagination,
        format: ExportFormat,
    ) -> Result<Vec<u8>, AuditError> {
        let entries =
            with_timeout("audit.query", self.timeout, self.store.query(filter, page)).await?;
        render(&entries, format)
    }

    /// `query` for an actor holding `view_audit_logs`, confined to the
    /// actor's tenant unless they hold `manage_all_tenants`.
    pub async fn query_as(
        &self,
        actor: Option<&Actor>,
        filter: AuditFilter,
        page: Pagination,
    ) -> Result<Page<AuditEntry>, AuditError> {
        let actor = self.gate.require_permission(actor, Permission::ViewAuditLogs)?;
        let filter = self.scope_filter(actor, filter)?;
        self.query(&filter, page).await
    }

    /// `export` for an actor holding `export_audit_logs`. The export itself is
    /// recorded as a privileged action.
    pub async fn export_as(
        &self,
        actor: Option<&Actor>,
        filter: AuditFilter,
        page: Pagination,
        format: ExportFormat,
        correlation_id: &str,
    ) -> Result<Vec<u8>, AuditError> {
        let actor = self.gate.require_permission(actor, Permission::ExportAuditLogs)?;
        let filter = self.scope_filter(actor, filter)?;
        let body = self.export(&filter, page, format).await?;

        let entry = AuditEntry::new(
            ENTITY_AUDIT_LOG,
            format!("export:{}", format.file_extension()),
            AuditAction::Exported,
            correlation_id,
        )
        .with_actor(&actor.id)
        .with_tenant(actor.company_id.as_ref())
        .with_metadata("limit", page.limit.to_string())
        .with_metadata("offset", page.offset.to_string())
        .with_metadata("bytes", body.len().to_string());
        if let Err(error) = self.append(entry).await {
            warn!(
                event_name = "audit.export.record_failed",
                correlation_id = %correlation_id,
                error = %error,
                "audit export succeeded but could not be recorded"
            );
        }

        Ok(body)
    }

    fn scope_filter(&self, actor: &Actor, filter: AuditFilter) -> Result<AuditFilter, AuditError> {
        if self.gate.has_permission(&actor.role, Permission::ManageAllTenants) {
            return Ok(filter);
        }

        let own_scope = match &actor.company_id {
            Some(company_id) => TenantScope::Tenant(company_id.clone()),
            None => TenantScope::Untenanted,
        };
        match &filter.tenant {
            TenantScope::Any => Ok(AuditFilter { tenant: own_scope, ..filter }),
            requested if *requested == own_scope => Ok(filter),
            TenantScope::Tenant(tenant_id) => Err(AuditError::Forbidden(
                AuthorizationError::TenantMismatch {
                    actor_id: actor.id.0.clone(),
                    tenant_id: tenant_id.0.clone(),
                },
            )),
            TenantScope::Untenanted => Err(AuditError::Forbidden(
                AuthorizationError::TenantMismatch {
                    actor_id: actor.id.0.clone(),
                    tenant_id: "(none)".to_string(),
                },
            )),
        }
    }
}

fn render(entries: &[AuditEntry], format: ExportFormat) -> Result<Vec<u8>, AuditError> {
    match format {
        ExportFormat::Json => serde_json::to_vec_pretty(entries)
            .map_err(|error| AuditError::Serialization(error.to_string())),
        ExportFormat::Csv => render_csv(entries),
    }
}

fn render_csv(entries: &[AuditEntry]) -> Result<Vec<u8>, AuditError> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(Vec::new());
    let csv_error = |error: csv::Error| AuditError::Serialization(error.to_string());

    writer.write_record(CSV_HEADER).map_err(csv_error)?;
    for entry in entries {
        let metadata = serde_json::to_string(&entry.metadata)
            .map_err(|error| AuditError::Serialization(error.to_string()))?;
        let created_at = entry.created_at.to_rfc3339();
        let record = [
            Cow::Borrowed(entry.id.0.as_str()),
            Cow::Borrowed(created_at.as_str()),
            neutralize_formula(&entry.entity_type),
            neutralize_formula(&entry.entity_id),
            Cow::Borrowed(entry.action.as_str()),
            Cow::Borrowed(entry.from_status.map(|status| status.as_str()).unwrap_or("")),
            Cow::Borrowed(entry.to_status.map(|status| status.as_str()).unwrap_or("")),
            entry.actor_id.as_ref().map(|id| neutralize_formula(&id.0)).unwrap_or_default(),
            entry.tenant_id.as_ref().map(|id| neutralize_formula(&id.0)).unwrap_or_default(),
            neutralize_formula(&entry.correlation_id),
            Cow::Owned(metadata),
        ];
        writer.write_record(record.iter().map(|field| field.as_ref())).map_err(csv_error)?;
    }

    writer.into_inner().map_err(|error| AuditError::Serialization(error.to_string()))
}

/// Spreadsheet applications evaluate cells starting with these characters.
fn neutralize_formula(value: &str) -> Cow<'_, str> {
    match value.chars().next() {
        Some('=' | '+' | '-' | '@' | '\t' | '\r') => Cow::Owned(format!("'{value}")),
        _ => Cow::Borrowed(value),
    }
}

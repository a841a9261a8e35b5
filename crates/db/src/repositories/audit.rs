use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use waypoint_core::audit::{AuditFilter, Pagination, TenantScope};
use waypoint_core::domain::actor::{ActorId, CompanyId};
use waypoint_core::domain::audit::{AuditAction, AuditEntry, AuditEntryId};
use waypoint_core::domain::request::RequestStatus;
use waypoint_core::errors::StoreError;
use waypoint_core::store::AuditStore;

use super::{format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

/// Shared predicate. Binds, in order: entity_type, entity_id, action,
/// tenant scope (`any` | `tenant` | `untenanted`), tenant id.
const FILTER_CLAUSE: &str = "(?1 IS NULL OR entity_type = ?1)
       AND (?2 IS NULL OR entity_id = ?2)
       AND (?3 IS NULL OR action = ?3)
       AND (?4 = 'any'
            OR (?4 = 'tenant' AND tenant_id = ?5)
            OR (?4 = 'untenanted' AND tenant_id IS NULL))";

pub struct SqlAuditStore {
    pool: DbPool,
}

impl SqlAuditStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

struct FilterBinds<'a> {
    entity_type: Option<&'a str>,
    entity_id: Option<&'a str>,
    action: Option<&'static str>,
    scope: &'static str,
    tenant_id: Option<&'a str>,
}

impl<'a> FilterBinds<'a> {
    fn from_filter(filter: &'a AuditFilter) -> Self {
        let (scope, tenant_id) = match &filter.tenant {
            TenantScope::Any => ("any", None),
            TenantScope::Tenant(company) => ("tenant", Some(company.0.as_str())),
            TenantScope::Untenanted => ("untenanted", None),
        };
        Self {
            entity_type: filter.entity_type.as_deref(),
            entity_id: filter.entity_id.as_deref(),
            action: filter.action.map(|action| action.as_str()),
            scope,
            tenant_id,
        }
    }
}

#[async_trait]
impl AuditStore for SqlAuditStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_string(&entry.metadata)
            .map_err(|error| RepositoryError::Encode(error.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO audit_log (
                id,
                entity_type,
                entity_id,
                action,
                from_status,
                to_status,
                actor_id,
                tenant_id,
                correlation_id,
                metadata_json,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id.0)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.action.as_str())
        .bind(entry.from_status.map(|status| status.as_str()))
        .bind(entry.to_status.map(|status| status.as_str()))
        .bind(entry.actor_id.as_ref().map(|actor| actor.0.as_str()))
        .bind(entry.tenant_id.as_ref().map(|tenant| tenant.0.as_str()))
        .bind(&entry.correlation_id)
        .bind(&metadata_json)
        .bind(format_timestamp(&entry.created_at))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from);

        match result {
            Ok(_) => Ok(()),
            Err(error) if error.is_unique_violation() => Err(StoreError::Duplicate(entry.id.0)),
            Err(error) => Err(error.into()),
        }
    }

    async fn query(
        &self,
        filter: &AuditFilter,
        page: Pagination,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let binds = FilterBinds::from_filter(filter);
        let sql = format!(
            "SELECT
                id,
                entity_type,
                entity_id,
                action,
                from_status,
                to_status,
                actor_id,
                tenant_id,
                correlation_id,
                metadata_json,
                created_at
             FROM audit_log
             WHERE {FILTER_CLAUSE}
             ORDER BY created_at ASC, seq ASC
             LIMIT ?6 OFFSET ?7"
        );

        let rows = sqlx::query(&sql)
            .bind(binds.entity_type)
            .bind(binds.entity_id)
            .bind(binds.action)
            .bind(binds.scope)
            .bind(binds.tenant_id)
            .bind(i64::from(page.limit))
            .bind(i64::try_from(page.offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(entry_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn count(&self, filter: &AuditFilter) -> Result<u64, StoreError> {
        let binds = FilterBinds::from_filter(filter);
        let sql = format!("SELECT COUNT(*) AS count FROM audit_log WHERE {FILTER_CLAUSE}");

        let count = sqlx::query(&sql)
            .bind(binds.entity_type)
            .bind(binds.entity_id)
            .bind(binds.action)
            .bind(binds.scope)
            .bind(binds.tenant_id)
            .fetch_one(&self.pool)
            .await
            .map_err(RepositoryError::from)?
            .try_get::<i64, _>("count")
            .map_err(RepositoryError::from)?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn entry_from_row(row: SqliteRow) -> Result<AuditEntry, RepositoryError> {
    let action_raw = row.try_get::<String, _>("action")?;
    let action = AuditAction::parse(&action_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown audit action `{action_raw}`")))?;

    let metadata_raw = row.try_get::<String, _>("metadata_json")?;
    let metadata = serde_json::from_str::<BTreeMap<String, String>>(&metadata_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid audit metadata ({error})")))?;

    Ok(AuditEntry {
        id: AuditEntryId(row.try_get("id")?),
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        action,
        from_status: parse_optional_status("from_status", row.try_get("from_status")?)?,
        to_status: parse_optional_status("to_status", row.try_get("to_status")?)?,
        actor_id: row.try_get::<Option<String>, _>("actor_id")?.map(ActorId),
        tenant_id: row.try_get::<Option<String>, _>("tenant_id")?.map(CompanyId),
        correlation_id: row.try_get("correlation_id")?,
        metadata,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn parse_optional_status(
    column: &str,
    value: Option<String>,
) -> Result<Option<RequestStatus>, RepositoryError> {
    value
        .map(|raw| {
            RequestStatus::parse(&raw).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown status in `{column}`: `{raw}`"))
            })
        })
        .transpose()
}

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::info;
use waypoint_core::audit::{AuditFilter, AuditLog, ExportFormat, Pagination, TenantScope};
use waypoint_core::authz::{roles, AuthorizationGate};
use waypoint_core::domain::actor::{Actor, CompanyId};
use waypoint_core::domain::audit::AuditAction;
use waypoint_db::SqlAuditStore;

use crate::commands::{load_config, open_database, runtime, CommandResult, Failure};

const COMMAND: &str = "audit-export";

#[derive(Clone, Debug, Default)]
pub struct AuditExportArgs {
    pub format: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub action: Option<String>,
    /// `none` selects entries without a tenant.
    pub tenant: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub output: Option<PathBuf>,
    pub operator: String,
}

#[derive(Debug, Serialize)]
struct ExportSummary {
    path: String,
    format: &'static str,
    bytes: usize,
}

/// Exports audit entries as the operator. The operator acts with the admin
/// role, and the export itself is recorded in the audit log.
pub fn run(args: AuditExportArgs) -> CommandResult {
    let (format, filter) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(failure) => return CommandResult::from_failure(COMMAND, failure),
    };
    let config = match load_config(COMMAND) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let gate = match config.role_registry() {
        Ok(registry) => AuthorizationGate::new(registry),
        Err(error) => {
            return CommandResult::failure(COMMAND, "config_validation", error.to_string(), 2);
        }
    };
    let runtime = match runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let correlation_id = format!("cli-export-{}", Utc::now().timestamp_millis());
    let operator = Actor::new(args.operator.trim(), roles::ADMIN);
    let page = Pagination::new(args.limit, args.offset);
    let store_timeout = Duration::from_millis(config.lifecycle.store_timeout_ms);

    let exported = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let audit = AuditLog::new(Arc::new(SqlAuditStore::new(pool.clone())), gate, store_timeout);
        let body = audit
            .export_as(Some(&operator), filter, page, format, &correlation_id)
            .await
            .map_err(|error| ("audit_query", error.to_string(), 7u8));
        pool.close().await;
        body
    });
    let body = match exported {
        Ok(body) => body,
        Err(failure) => return CommandResult::from_failure(COMMAND, failure),
    };

    info!(
        event_name = "cli.audit.exported",
        correlation_id = %correlation_id,
        operator = %operator.id,
        format = format.file_extension(),
        bytes = body.len(),
        "audit log exported"
    );

    match args.output {
        None => {
            CommandResult { exit_code: 0, output: String::from_utf8_lossy(&body).into_owned() }
        }
        Some(path) => match fs::write(&path, &body) {
            Ok(()) => CommandResult::success_with(
                COMMAND,
                format!("wrote {} bytes to {}", body.len(), path.display()),
                Some(ExportSummary {
                    path: path.display().to_string(),
                    format: format.file_extension(),
                    bytes: body.len(),
                }),
            ),
            Err(error) => CommandResult::failure(
                COMMAND,
                "output_write",
                format!("failed to write {}: {error}", path.display()),
                8,
            ),
        },
    }
}

fn parse_args(args: &AuditExportArgs) -> Result<(ExportFormat, AuditFilter), Failure> {
    let format = ExportFormat::parse(&args.format)
        .map_err(|error| ("invalid_argument", error.to_string(), 6u8))?;
    if args.operator.trim().is_empty() {
        return Err(("invalid_argument", "operator must not be empty".to_string(), 6));
    }
    let action = match args.action.as_deref() {
        Some(raw) => Some(AuditAction::parse(raw).ok_or_else(|| {
            ("invalid_argument", format!("unknown audit action `{raw}`"), 6u8)
        })?),
        None => None,
    };
    let tenant = match args.tenant.as_deref().map(str::trim) {
        None => TenantScope::Any,
        Some("none") => TenantScope::Untenanted,
        Some(tenant) => TenantScope::Tenant(CompanyId(tenant.to_string())),
    };

    Ok((
        format,
        AuditFilter {
            entity_type: args.entity_type.clone(),
            entity_id: args.entity_id.clone(),
            action,
            tenant,
        },
    ))
}

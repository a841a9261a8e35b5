use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use chrono::Utc;
use serde_json::Value;
use tempfile::TempDir;
use waypoint_cli::commands::audit_export::{self, AuditExportArgs};
use waypoint_cli::commands::outbox::{self, OutboxAction};
use waypoint_cli::commands::{config, doctor, migrate};
use waypoint_core::domain::actor::{ActorId, CompanyId};
use waypoint_core::domain::audit::{AuditAction, AuditEntry};
use waypoint_core::domain::request::RequestStatus;
use waypoint_core::notify::{DomainEvent, EventKind, NotificationSink};
use waypoint_core::store::AuditStore;
use waypoint_db::{connect_with_settings, migrations, SqlAuditStore, SqlOutboxSink};

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("WAYPOINT_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_incomplete_http_provider() {
    with_env(
        &[("WAYPOINT_DATABASE_URL", "sqlite::memory:"), ("WAYPOINT_BOOKING_PROVIDER", "http")],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 2, "expected config validation failure code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["status"], "error");
            assert_eq!(payload["error_class"], "config_validation");
            assert!(payload["message"].as_str().unwrap_or_default().contains("booking.base_url"));
        },
    );
}

#[test]
fn config_reports_env_sources_and_redacts_the_api_key() {
    with_env(
        &[
            ("WAYPOINT_DATABASE_URL", "sqlite::memory:"),
            ("WAYPOINT_BOOKING_PROVIDER", "http"),
            ("WAYPOINT_BOOKING_BASE_URL", "https://bookings.example.test"),
            ("WAYPOINT_BOOKING_API_KEY", "bk-live-secret"),
            ("WAYPOINT_LOG_LEVEL", "debug"),
        ],
        || {
            let output = config::run();

            assert!(output.contains(
                "- booking.provider = http (source: env (WAYPOINT_BOOKING_PROVIDER))"
            ));
            assert!(output.contains("- booking.api_key = <redacted>"));
            assert!(output.contains("- logging.level = debug (source: env (WAYPOINT_LOG_LEVEL))"));
            assert!(output.contains("- server.port = 8080 (source: default)"));
            assert!(!output.contains("bk-live-secret"));
        },
    );
}

#[test]
fn doctor_flags_an_unmigrated_database_until_migrate_runs() {
    let dir = TempDir::new().expect("temp dir");
    let url = database_url(dir.path());

    with_env(&[("WAYPOINT_DATABASE_URL", url.as_str())], || {
        let before: Value =
            serde_json::from_str(&doctor::run(true)).expect("doctor emits JSON");
        assert_eq!(before["overall_status"], "fail");
        let schema = check(&before, "database_schema");
        assert_eq!(schema["status"], "fail");
        assert!(schema["details"].as_str().unwrap_or_default().contains("waypoint migrate"));

        assert_eq!(migrate::run().exit_code, 0);

        let after: Value = serde_json::from_str(&doctor::run(true)).expect("doctor emits JSON");
        assert_eq!(after["overall_status"], "pass");
        assert_eq!(check(&after, "booking_provider")["status"], "pass");
    });
}

#[test]
fn audit_export_writes_csv_and_records_the_export() {
    let dir = TempDir::new().expect("temp dir");
    let url = database_url(dir.path());
    let output_path = dir.path().join("acme-audit.csv");

    with_env(&[("WAYPOINT_DATABASE_URL", url.as_str())], || {
        seed(&url, |pool| async move {
            let store = SqlAuditStore::new(pool);
            let approved = AuditEntry::new("travel_request", "TR-1", AuditAction::Approved, "corr-1")
                .with_transition(Some(RequestStatus::Submitted), RequestStatus::Approved)
                .with_actor(&ActorId("cc-1".to_string()))
                .with_tenant(Some(&CompanyId("ACME".to_string())));
            let other_tenant =
                AuditEntry::new("travel_request", "TR-2", AuditAction::Create, "corr-2")
                    .with_tenant(Some(&CompanyId("GLOBEX".to_string())));
            store.append(approved).await.expect("append");
            store.append(other_tenant).await.expect("append");
        });

        let result = audit_export::run(AuditExportArgs {
            format: "csv".to_string(),
            tenant: Some("ACME".to_string()),
            output: Some(output_path.clone()),
            operator: "ops-7".to_string(),
            ..AuditExportArgs::default()
        });
        assert_eq!(result.exit_code, 0, "unexpected output: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "audit-export");
        assert_eq!(payload["data"]["format"], "csv");

        let csv = std::fs::read_to_string(&output_path).expect("export file");
        assert!(csv.starts_with("id,created_at,entity_type"));
        assert!(csv.contains("TR-1"));
        assert!(!csv.contains("TR-2"));

        let stdout = audit_export::run(AuditExportArgs {
            format: "json".to_string(),
            action: Some("exported".to_string()),
            operator: "ops-7".to_string(),
            ..AuditExportArgs::default()
        });
        assert_eq!(stdout.exit_code, 0);
        let exports: Value = serde_json::from_str(&stdout.output).expect("json export");
        let exports = exports.as_array().expect("json export is an array");
        assert_eq!(exports.len(), 1, "first export should be recorded exactly once");
        assert_eq!(exports[0]["actor_id"], "ops-7");
    });
}

#[test]
fn audit_export_rejects_unsupported_formats_before_touching_the_database() {
    with_env(&[("WAYPOINT_DATABASE_URL", "sqlite::memory:")], || {
        let result = audit_export::run(AuditExportArgs {
            format: "xlsx".to_string(),
            operator: "ops-7".to_string(),
            ..AuditExportArgs::default()
        });

        assert_eq!(result.exit_code, 6);
        let payload = parse_payload(&result.output);
        assert_eq!(payload["error_class"], "invalid_argument");
    });
}

#[test]
fn outbox_lists_pending_events_and_acknowledges_once() {
    let dir = TempDir::new().expect("temp dir");
    let url = database_url(dir.path());

    with_env(&[("WAYPOINT_DATABASE_URL", url.as_str())], || {
        seed(&url, |pool| async move {
            let sink = SqlOutboxSink::new(pool);
            sink.publish(DomainEvent {
                kind: EventKind::StatusChanged,
                dedupe_key: "status:TR-1:v2".to_string(),
                entity_id: "TR-1".to_string(),
                tenant_id: Some(CompanyId("ACME".to_string())),
                correlation_id: "corr-outbox".to_string(),
                attributes: BTreeMap::from([("to".to_string(), "approved".to_string())]),
                occurred_at: Utc::now(),
            })
            .await
            .expect("publish");
        });

        let pending = outbox::run(OutboxAction::Pending { limit: 10 });
        assert_eq!(pending.exit_code, 0);
        let payload = parse_payload(&pending.output);
        let records = payload["data"].as_array().expect("pending records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["event"]["dedupe_key"], "status:TR-1:v2");
        let seq = records[0]["seq"].as_i64().expect("sequence number");

        let first_ack = outbox::run(OutboxAction::Ack { seq });
        assert_eq!(first_ack.exit_code, 0);

        let second_ack = outbox::run(OutboxAction::Ack { seq });
        assert_eq!(second_ack.exit_code, 9);
        assert_eq!(parse_payload(&second_ack.output)["error_class"], "not_pending");

        let drained = parse_payload(&outbox::run(OutboxAction::Pending { limit: 10 }).output);
        assert_eq!(drained["data"].as_array().map(Vec::len), Some(0));
    });
}

fn database_url(dir: &Path) -> String {
    format!("sqlite://{}", dir.join("waypoint.db").display())
}

fn seed<F, Fut>(url: &str, body: F)
where
    F: FnOnce(waypoint_db::DbPool) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime should build");
    runtime.block_on(async {
        let pool = connect_with_settings(url, 1, 5).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        body(pool.clone()).await;
        pool.close().await;
    });
}

fn check<'a>(report: &'a Value, name: &str) -> &'a Value {
    report["checks"]
        .as_array()
        .and_then(|checks| checks.iter().find(|check| check["name"] == name))
        .unwrap_or(&Value::Null)
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "WAYPOINT_DATABASE_URL",
        "WAYPOINT_DATABASE_MAX_CONNECTIONS",
        "WAYPOINT_DATABASE_TIMEOUT_SECS",
        "WAYPOINT_SERVER_BIND_ADDRESS",
        "WAYPOINT_SERVER_PORT",
        "WAYPOINT_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "WAYPOINT_LIFECYCLE_STORE_TIMEOUT_MS",
        "WAYPOINT_LIFECYCLE_DEFAULT_REJECTION_REASON",
        "WAYPOINT_BOOKING_PROVIDER",
        "WAYPOINT_BOOKING_BASE_URL",
        "WAYPOINT_BOOKING_API_KEY",
        "WAYPOINT_BOOKING_TIMEOUT_MS",
        "WAYPOINT_BOOKING_STALE_CLAIM_SECS",
        "WAYPOINT_LOGGING_LEVEL",
        "WAYPOINT_LOGGING_FORMAT",
        "WAYPOINT_LOG_LEVEL",
        "WAYPOINT_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}

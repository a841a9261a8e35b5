use serde::Serialize;
use waypoint_core::config::{AppConfig, LoadOptions, ProviderKind};
use waypoint_db::{connect_with_settings, migrations};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_role_registry(&config));
            checks.push(check_booking_provider(&config));
            checks.push(check_database_schema(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["role_registry", "booking_provider", "database_schema"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_role_registry(config: &AppConfig) -> DoctorCheck {
    match config.role_registry() {
        Ok(_) if config.roles.is_empty() => DoctorCheck {
            name: "role_registry",
            status: CheckStatus::Pass,
            details: "built-in role registry".to_string(),
        },
        Ok(_) => DoctorCheck {
            name: "role_registry",
            status: CheckStatus::Pass,
            details: format!("{} role override(s) applied", config.roles.len()),
        },
        Err(error) => {
            DoctorCheck { name: "role_registry", status: CheckStatus::Fail, details: error.to_string() }
        }
    }
}

fn check_booking_provider(config: &AppConfig) -> DoctorCheck {
    let details = match config.booking.provider {
        ProviderKind::Sandbox => "sandbox provider (no external calls)".to_string(),
        ProviderKind::Http => format!(
            "http provider at `{}` with {}ms timeout",
            config.booking.base_url.as_deref().unwrap_or("<unset>"),
            config.booking.timeout_ms
        ),
    };
    DoctorCheck { name: "booking_provider", status: CheckStatus::Pass, details }
}

/// Connects and reports whether the baseline tables exist. Never migrates.
fn check_database_schema(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database_schema",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;

        let missing = migrations::missing_tables(&pool).await;
        pool.close().await;
        missing.map_err(|error| format!("failed to inspect schema: {error}"))
    });

    match result {
        Ok(missing) if missing.is_empty() => DoctorCheck {
            name: "database_schema",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`; schema is current", config.database.url),
        },
        Ok(missing) => DoctorCheck {
            name: "database_schema",
            status: CheckStatus::Fail,
            details: format!("missing tables [{}]; run `waypoint migrate`", missing.join(", ")),
        },
        Err(error) => {
            DoctorCheck { name: "database_schema", status: CheckStatus::Fail, details: error }
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

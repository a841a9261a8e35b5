pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::audit_export::AuditExportArgs;
use commands::outbox::OutboxAction;

#[derive(Debug, Parser)]
#[command(
    name = "waypoint",
    about = "Waypoint operator CLI",
    long_about = "Operate Waypoint migrations, configuration inspection, audit exports and the notification outbox.",
    after_help = "Examples:\n  waypoint migrate\n  waypoint doctor --json\n  waypoint audit-export --format csv --tenant ACME --output acme-audit.csv\n  waypoint outbox pending --limit 20"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, role registry, booking provider and database schema")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Export audit entries as JSON or CSV; the export is itself audited")]
    AuditExport {
        #[arg(long, default_value = "csv", help = "Export format: json or csv")]
        format: String,
        #[arg(long, help = "Only entries for this entity type (e.g. travel_request)")]
        entity_type: Option<String>,
        #[arg(long, help = "Only entries for this entity id")]
        entity_id: Option<String>,
        #[arg(long, help = "Only entries with this action (e.g. approved)")]
        action: Option<String>,
        #[arg(long, help = "Only entries for this tenant; `none` selects untenanted entries")]
        tenant: Option<String>,
        #[arg(long, help = "Page size, clamped to 1..=500")]
        limit: Option<i64>,
        #[arg(long, help = "Entries to skip")]
        offset: Option<i64>,
        #[arg(long, help = "Write to this file instead of stdout")]
        output: Option<PathBuf>,
        #[arg(long, default_value = "operator", help = "Operator id recorded on the export entry")]
        operator: String,
    },
    #[command(about = "Inspect and acknowledge queued notifications")]
    Outbox {
        #[command(subcommand)]
        action: OutboxCommand,
    },
}

#[derive(Debug, Subcommand)]
enum OutboxCommand {
    #[command(about = "List undelivered notifications, oldest first")]
    Pending {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    #[command(about = "Mark a notification delivered by sequence number")]
    Ack { seq: i64 },
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

pub fn run() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::AuditExport {
            format,
            entity_type,
            entity_id,
            action,
            tenant,
            limit,
            offset,
            output,
            operator,
        } => commands::audit_export::run(AuditExportArgs {
            format,
            entity_type,
            entity_id,
            action,
            tenant,
            limit,
            offset,
            output,
            operator,
        }),
        Command::Outbox { action } => commands::outbox::run(match action {
            OutboxCommand::Pending { limit } => OutboxAction::Pending { limit },
            OutboxCommand::Ack { seq } => OutboxAction::Ack { seq },
        }),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{Cli, Command, OutboxCommand};

    #[test]
    fn command_definitions_are_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn audit_export_defaults_to_csv_as_operator() {
        let cli = Cli::try_parse_from(["waypoint", "audit-export", "--tenant", "ACME"])
            .expect("arguments should parse");

        match cli.command {
            Command::AuditExport { format, tenant, operator, .. } => {
                assert_eq!(format, "csv");
                assert_eq!(tenant.as_deref(), Some("ACME"));
                assert_eq!(operator, "operator");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn outbox_ack_takes_a_sequence_number() {
        let cli = Cli::try_parse_from(["waypoint", "outbox", "ack", "42"]).expect("parse");
        assert!(matches!(cli.command, Command::Outbox { action: OutboxCommand::Ack { seq: 42 } }));
        assert!(Cli::try_parse_from(["waypoint", "outbox", "ack", "latest"]).is_err());
    }
}

use chrono::Utc;
use serde::Serialize;
use waypoint_db::{OutboxRecord, SqlOutboxSink};

use crate::commands::{load_config, open_database, runtime, CommandResult, Failure};

const COMMAND: &str = "outbox";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboxAction {
    /// List undelivered notifications, oldest first.
    Pending { limit: u32 },
    /// Mark one notification delivered by its sequence number.
    Ack { seq: i64 },
}

#[derive(Debug, Serialize)]
struct AckSummary {
    seq: i64,
    acknowledged: bool,
}

pub fn run(action: OutboxAction) -> CommandResult {
    let config = match load_config(COMMAND) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    runtime.block_on(async {
        let pool = match open_database(&config).await {
            Ok(pool) => pool,
            Err(failure) => return CommandResult::from_failure(COMMAND, failure),
        };
        let sink = SqlOutboxSink::new(pool.clone());
        let result = match action {
            OutboxAction::Pending { limit } => pending(&sink, limit).await,
            OutboxAction::Ack { seq } => ack(&sink, seq).await,
        };
        pool.close().await;
        result.unwrap_or_else(|failure| CommandResult::from_failure(COMMAND, failure))
    })
}

async fn pending(sink: &SqlOutboxSink, limit: u32) -> Result<CommandResult, Failure> {
    let records: Vec<OutboxRecord> =
        sink.pending(limit).await.map_err(|error| ("outbox_query", error.to_string(), 7u8))?;
    Ok(CommandResult::success_with(
        COMMAND,
        format!("{} notification(s) awaiting delivery", records.len()),
        Some(records),
    ))
}

async fn ack(sink: &SqlOutboxSink, seq: i64) -> Result<CommandResult, Failure> {
    let acknowledged = sink
        .mark_delivered(seq, Utc::now())
        .await
        .map_err(|error| ("outbox_update", error.to_string(), 7u8))?;
    if !acknowledged {
        return Err((
            "not_pending",
            format!("notification {seq} does not exist or was already delivered"),
            9,
        ));
    }
    Ok(CommandResult::success_with(
        COMMAND,
        format!("notification {seq} marked delivered"),
        Some(AckSummary { seq, acknowledged }),
    ))
}

use tracing::info;

use crate::commands::{load_config, open_database, runtime, CommandResult, Failure};

pub fn run() -> CommandResult {
    let config = match load_config("migrate") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("migrate") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        pool.close().await;
        Ok::<(), Failure>(())
    });

    match result {
        Ok(()) => {
            info!(
                event_name = "cli.migrate.applied",
                correlation_id = "cli",
                database_url = %config.database.url,
                "applied pending migrations"
            );
            CommandResult::success("migrate", "applied pending migrations")
        }
        Err(failure) => CommandResult::from_failure("migrate", failure),
    }
}

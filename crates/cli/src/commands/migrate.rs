use shutterdesk_core::config::LoadOptions;
use shutterdesk_db::{connect_with_settings, migrations};

use crate::commands::{block_on, load_config, CommandResult};

pub fn run(options: LoadOptions) -> CommandResult {
    let config = match load_config("migrate", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let result = block_on("migrate", async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| CommandResult::failure("migrate", "db_connectivity", error.to_string(), 4))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| CommandResult::failure("migrate", "migration", error.to_string(), 5))?;
        pool.close().await;
        Ok(())
    });

    match result {
        Ok(()) => {
            tracing::info!(event_name = "system.bootstrap.migrated", "migrations applied");
            CommandResult::success("migrate", "applied pending migrations")
        }
        Err(failure) => failure,
    }
}

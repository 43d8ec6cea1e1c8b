use crate::commands::{block_on, CommandResult};
use countersign_core::config::{AppConfig, LoadOptions};
use countersign_db::{connect_with_config, migrations};

pub fn run(options: LoadOptions) -> CommandResult {
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let result = block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        let applied = migrations::MIGRATOR
            .iter()
            .filter(|migration| migration.migration_type.is_up_migration())
            .count();
        pool.close().await;
        Ok::<usize, (&'static str, String, u8)>(applied)
    });

    match result {
        Ok(Ok(applied)) => {
            tracing::info!(
                event_name = "system.migrate.completed",
                correlation_id = "migrate",
                known_migrations = applied,
                "database migrations applied"
            );
            CommandResult::success(
                "migrate",
                format!("schema is current ({applied} known migrations)"),
            )
        }
        Ok(Err((error_class, message, exit_code))) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
        Err(error) => CommandResult::failure("migrate", "runtime_init", format!("{error:#}"), 3),
    }
}

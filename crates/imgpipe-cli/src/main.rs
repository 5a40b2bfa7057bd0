//! imgpipe CLI - Main entry point

use clap::Parser;
use imgpipe_cli::{commands, Cli, Commands, DatasetCommand};
use imgpipe_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Warn
        })
        .output(LogOutput::Console)
        .log_file_prefix("imgpipe-cli")
        .filter_directives("sqlx=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // The CLI works without logging
    let _guard = init_logging(&log_config).ok();

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> imgpipe_cli::Result<()> {
    let db = cli.database_url.as_deref();

    match &cli.command {
        Commands::Migrate => commands::migrate::run(db).await,

        Commands::Dataset { command } => match command {
            DatasetCommand::Register { name } => {
                commands::dataset::register(db, name, cli.json).await
            }
            DatasetCommand::List => commands::dataset::list(db, cli.json).await,
        },

        Commands::Status {
            dataset,
            stage,
            stages,
        } => commands::status::run(db, dataset, *stage, *stages, cli.json).await,

        Commands::Chain {
            dataset,
            key,
            entries,
        } => commands::chain::run(db, dataset, key.as_deref(), *entries, cli.json).await,

        Commands::Dead { dataset, stage } => {
            commands::dead::list(db, dataset, *stage, cli.json).await
        }

        Commands::Revive {
            dataset,
            stage,
            key,
        } => commands::dead::revive(db, dataset, *stage, key, cli.json).await,
    }
}

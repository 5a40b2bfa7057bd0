//! imgpipe Worker - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgpipe_common::logging::{init_logging, LogConfig};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use imgpipe_server::{
    config::{RunMode, WorkerConfig},
    manifest::{ManifestStore, PgManifestStore},
    runner::{
        process_keys, CommandTransform, PassthroughTransform, StageRunner, Transform, Trigger,
    },
    staging::NvmeStagingCoordinator,
    storage::{ObjectStoreGateway, S3Gateway},
};

/// Runs one pipeline stage against the shared manifest store
#[derive(Parser)]
#[command(name = "imgpipe-worker")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Process keys for the configured stage (the default)
    Run {
        /// Override MODE
        #[arg(long)]
        mode: Option<RunMode>,

        /// Process exactly these keys and exit
        #[arg(long, num_args = 1..)]
        keys: Vec<String>,

        /// Key prefix to scan, defaults to INPUT_PREFIX
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Clean up staging directories left by a previous process and exit
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Environment variables take precedence over these defaults
    let log_config = LogConfig::builder()
        .log_file_prefix("imgpipe-worker")
        .filter_directives("imgpipe_server=debug,sqlx=warn,aws_config=warn,aws_smithy_runtime=warn")
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    info!("Starting imgpipe worker");

    let config = WorkerConfig::load().context("Invalid worker configuration")?;
    info!(
        dataset = %config.stage.dataset_name,
        stage = config.stage.stage,
        mode = %config.stage.mode,
        "Configuration loaded"
    );

    let store = PgManifestStore::connect(&config.database, config.stage.retry_policy())
        .await
        .context("Failed to connect to the manifest database")?;
    store.migrate().await.context("Failed to run migrations")?;

    let dataset = store
        .register_dataset(&config.stage.dataset_name)
        .await
        .context("Failed to register dataset")?;
    info!(dataset_id = %dataset.id, "Dataset registered");

    let gateway: Arc<dyn ObjectStoreGateway> = Arc::new(S3Gateway::new(&config.storage).await);
    info!("Storage client initialized");

    let staging = NvmeStagingCoordinator::new(config.staging.clone(), Arc::clone(&gateway));
    let store: Arc<dyn ManifestStore> = Arc::new(store);

    let report = staging
        .reconcile(store.as_ref())
        .await
        .context("Staging reconciliation failed")?;
    info!(
        removed = report.removed,
        retained = report.retained,
        freed_bytes = report.freed_bytes,
        "Staging reconciled"
    );

    let (mode, keys, prefix) = match cli.command {
        Some(Command::Reconcile) => return Ok(()),
        Some(Command::Run { mode, keys, prefix }) => (mode, keys, prefix),
        None => (None, Vec::new(), None),
    };

    let transform: Arc<dyn Transform> = match config.stage.transform_command.as_deref() {
        Some(command_line) => match CommandTransform::parse(command_line) {
            Some(command) => Arc::new(command),
            None => anyhow::bail!("TRANSFORM_COMMAND is empty"),
        },
        None => {
            warn!("TRANSFORM_COMMAND not set, copying inputs through unchanged");
            Arc::new(PassthroughTransform)
        }
    };
    info!(transform = transform.name(), "Transform selected");

    let cancel = CancellationToken::new();
    let runner = StageRunner::new(
        config.stage.runner_config(dataset.id),
        store,
        gateway,
        staging,
        transform,
    )
    .with_cancellation(cancel.clone());
    info!(worker_id = runner.worker_id(), "Runner ready");

    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });

    let prefix = prefix.unwrap_or_else(|| config.stage.input_prefix.clone());
    let summary = if !keys.is_empty() {
        process_keys(&runner, &keys).await
    } else {
        match mode.unwrap_or(config.stage.mode) {
            RunMode::Once => runner.run_trigger(&Trigger::poll(prefix)).await?,
            RunMode::Poll => runner.run_polling(&prefix).await?,
        }
    };

    info!(
        processed = summary.processed,
        adopted = summary.adopted,
        skipped = summary.skipped,
        requeued = summary.requeued,
        failed = summary.failed,
        dead = summary.dead,
        "Worker finished"
    );

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing in-flight keys");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing in-flight keys");
        },
    }
}

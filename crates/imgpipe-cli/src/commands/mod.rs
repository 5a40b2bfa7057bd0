//! Command implementations

use imgpipe_common::types::Dataset;
use imgpipe_server::config::DatabaseConfig;
use imgpipe_server::manifest::{ManifestStore, PgManifestStore, RetryPolicy};
use tracing::debug;

use crate::error::{CliError, Result};

pub mod chain;
pub mod dataset;
pub mod dead;
pub mod migrate;
pub mod status;

/// Open the manifest store; `database_url` overrides `DATABASE_URL`
pub async fn connect(database_url: Option<&str>) -> Result<PgManifestStore> {
    dotenvy::dotenv().ok();

    let mut config = DatabaseConfig::from_env();
    if let Some(url) = database_url {
        config.url = url.to_string();
    }
    // One operator, one connection
    config.min_connections = 0;
    config.max_connections = 2;
    config
        .validate()
        .map_err(|e| CliError::Config(e.to_string()))?;

    debug!(max_connections = config.max_connections, "Connecting to manifest store");
    Ok(PgManifestStore::connect(&config, RetryPolicy::default()).await?)
}

/// Look up a dataset by name
pub async fn find_dataset(store: &dyn ManifestStore, name: &str) -> Result<Dataset> {
    store
        .get_dataset_by_name(name)
        .await?
        .ok_or_else(|| CliError::DatasetNotFound(name.to_string()))
}

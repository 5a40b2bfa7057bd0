//! imgpipe Worker Library
//!
//! Coordinates a multi-stage image pipeline where every stage reads from
//! and writes to an object store, stages files on local NVMe, and records
//! what it produced in a shared manifest store.
//!
//! # Overview
//!
//! - **Storage**: the [`storage::ObjectStoreGateway`] seam over S3-compatible
//!   stores, plus an in-memory implementation for tests
//! - **Staging**: [`staging::NvmeStagingCoordinator`] hands out byte-accounted
//!   scratch directories and verifies every copy in and out
//! - **Manifest**: [`manifest::ManifestStore`] holds per-key claims, the state
//!   machine and the immutable per-stage manifests (PostgreSQL or in-memory)
//! - **Runner**: [`runner::StageRunner`] drives keys through claim, stage,
//!   transform, publish and mark-processed
//! - **Configuration**: environment-based configuration in [`config`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use imgpipe_server::config::WorkerConfig;
//! use imgpipe_server::manifest::{ManifestStore, PgManifestStore};
//! use imgpipe_server::runner::{PassthroughTransform, StageRunner, Trigger};
//! use imgpipe_server::staging::NvmeStagingCoordinator;
//! use imgpipe_server::storage::S3Gateway;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WorkerConfig::load()?;
//!     let store = PgManifestStore::connect(&config.database, config.stage.retry_policy()).await?;
//!     let dataset = store.register_dataset(&config.stage.dataset_name).await?;
//!     let gateway = Arc::new(S3Gateway::new(&config.storage).await);
//!     let staging = NvmeStagingCoordinator::new(config.staging.clone(), gateway.clone());
//!     let runner = StageRunner::new(
//!         config.stage.runner_config(dataset.id),
//!         Arc::new(store),
//!         gateway,
//!         staging,
//!         Arc::new(PassthroughTransform),
//!     );
//!     runner.run_trigger(&Trigger::poll("")).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod manifest;
pub mod runner;
pub mod staging;
pub mod storage;

// Re-export commonly used types
pub use error::{Disposition, StageError};

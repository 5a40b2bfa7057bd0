//! Shared fixtures for imgpipe worker integration tests
//!
//! - [`Harness`]: in-memory manifest store and object store with a manual
//!   clock and a temporary staging root, for crash and TTL scenarios
//! - [`TestPostgres`]: a PostgreSQL container with migrations applied
//!
//! PostgreSQL tests need Docker and are `#[ignore]`d by default:
//!
//! ```bash
//! cargo test -p imgpipe-server --test postgres_store_tests -- --ignored
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use imgpipe_server::manifest::{
    InMemoryManifestStore, ManifestStore, ManualClock, PgManifestStore, RetryPolicy,
};
use imgpipe_server::runner::{
    PassthroughTransform, RunnerConfig, StageRunner, Transform, TransformError, TransformInput,
    TransformOutput,
};
use imgpipe_server::staging::{NvmeStagingCoordinator, StagingConfig};
use imgpipe_server::storage::{InMemoryObjectStore, ObjectStoreGateway, ObjectUri};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;
use uuid::Uuid;

pub const RAW_BUCKET: &str = "raw";
pub const AUGMENTED_BUCKET: &str = "augmented";
pub const NORMALIZED_BUCKET: &str = "normalized";

/// Claim TTL used by every scenario
pub const CLAIM_TTL: Duration = Duration::from_secs(30);

pub fn uri(s: &str) -> ObjectUri {
    s.parse().unwrap_or_else(|e| panic!("bad test uri {s}: {e}"))
}

pub fn raw(key: &str) -> ObjectUri {
    ObjectUri::new(RAW_BUCKET, key)
}

/// Deterministic image-ish payload
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Route `tracing` output through the test harness; `RUST_LOG` overrides
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,imgpipe_server=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn fast_retry(max_attempts: i32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_backoff: Duration::from_secs(10),
        max_backoff: Duration::from_secs(60),
    }
}

// ============================================================================
// In-memory harness
// ============================================================================

pub struct Harness {
    pub root: TempDir,
    pub clock: ManualClock,
    pub store: Arc<InMemoryManifestStore>,
    pub objects: Arc<InMemoryObjectStore>,
    pub staging: StagingConfig,
    pub dataset_id: Uuid,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(fast_retry(5), 64 * 1024 * 1024).await
    }

    pub async fn with_options(retry: RetryPolicy, capacity_bytes: u64) -> Self {
        init_test_tracing();
        let root = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryManifestStore::with_clock(
            retry,
            Arc::new(clock.clone()),
        ));
        let dataset = store
            .register_dataset("drone-survey")
            .await
            .unwrap_or_else(|e| panic!("register dataset: {e}"));
        let staging = StagingConfig::for_testing(root.path(), capacity_bytes, 1024);

        Self {
            root,
            clock,
            store,
            objects: Arc::new(InMemoryObjectStore::new()),
            staging,
            dataset_id: dataset.id,
        }
    }

    pub fn gateway(&self) -> Arc<dyn ObjectStoreGateway> {
        self.objects.clone()
    }

    pub fn manifest_store(&self) -> Arc<dyn ManifestStore> {
        self.store.clone()
    }

    /// A fresh coordinator, as a new worker process would have
    pub fn coordinator(&self) -> NvmeStagingCoordinator {
        NvmeStagingCoordinator::new(self.staging.clone(), self.gateway())
    }

    pub fn runner_config(&self, stage: i32) -> RunnerConfig {
        let (input, output) = match stage {
            1 => (RAW_BUCKET, AUGMENTED_BUCKET),
            _ => (AUGMENTED_BUCKET, NORMALIZED_BUCKET),
        };
        let mut config = RunnerConfig::new(self.dataset_id, stage, input, output);
        config.claim_ttl = CLAIM_TTL;
        config.heartbeat_interval = Duration::from_secs(5);
        config.poll_interval = Duration::from_millis(20);
        config.page_size = 2;
        config
    }

    pub fn runner(
        &self,
        stage: i32,
        staging: NvmeStagingCoordinator,
        transform: Arc<dyn Transform>,
    ) -> StageRunner {
        StageRunner::new(
            self.runner_config(stage),
            self.manifest_store(),
            self.gateway(),
            staging,
            transform,
        )
    }

    pub fn seed(&self, key: &str, data: Vec<u8>) -> ObjectUri {
        let uri = raw(key);
        self.objects.insert(&uri, data);
        uri
    }

    pub fn lease_dirs(&self) -> usize {
        std::fs::read_dir(self.staging.leases_dir())
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }
}

// ============================================================================
// Test transforms
// ============================================================================

/// Passthrough that counts invocations and can be slowed down
#[derive(Default)]
pub struct CountingTransform {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingTransform {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transform for CountingTransform {
    fn name(&self) -> &str {
        "counting"
    }

    async fn run(&self, input: TransformInput) -> Result<TransformOutput, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        PassthroughTransform.run(input).await
    }
}

/// Always fails with the given error
pub struct FailingTransform(pub TransformError);

#[async_trait]
impl Transform for FailingTransform {
    fn name(&self) -> &str {
        "failing"
    }

    async fn run(&self, _input: TransformInput) -> Result<TransformOutput, TransformError> {
        Err(self.0.clone())
    }
}

/// Never finishes, like a transform stuck on a bad input
pub struct HangingTransform;

#[async_trait]
impl Transform for HangingTransform {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn run(&self, _input: TransformInput) -> Result<TransformOutput, TransformError> {
        std::future::pending().await
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        init_test_tracing();
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn store(&self, retry: RetryPolicy) -> PgManifestStore {
        PgManifestStore::new(self.pool.clone(), retry)
    }
}

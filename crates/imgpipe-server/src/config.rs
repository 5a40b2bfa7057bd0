//! Worker configuration management

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::manifest::RetryPolicy;
use crate::runner::RunnerConfig;
use crate::staging::StagingConfig;
use crate::storage::StorageConfig;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/imgpipe";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Stage Configuration Constants
// ============================================================================

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Claims live five minutes unless renewed.
pub const DEFAULT_CLAIM_TTL_SECS: u64 = 300;

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// A transform running longer than an hour is treated as hung.
pub const DEFAULT_TRANSFORM_TIMEOUT_SECS: u64 = 3600;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

pub const DEFAULT_RETRY_BASE_DELAY_SECS: u64 = 30;

pub const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 1800;

pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

pub const DEFAULT_ALLOWED_EXTENSIONS: &str = ".jpg,.jpeg,.png";

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub staging: StagingConfig,
    pub stage: StageConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// How the worker discovers keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Rescan the input prefix every poll interval
    #[default]
    Poll,
    /// Scan once and exit
    Once,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "poll" => Ok(RunMode::Poll),
            "once" => Ok(RunMode::Once),
            other => Err(format!("Invalid mode: {other}. Use 'poll' or 'once'")),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Poll => f.write_str("poll"),
            RunMode::Once => f.write_str("once"),
        }
    }
}

/// Per-stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Logical dataset name; registered on startup
    pub dataset_name: String,
    pub stage: i32,
    pub input_bucket: String,
    pub input_prefix: String,
    pub output_bucket: String,
    pub output_prefix: String,
    pub mode: RunMode,
    pub poll_interval_secs: u64,
    pub claim_ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub transform_timeout_secs: u64,
    pub max_attempts: i32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub concurrency: usize,
    pub allowed_extensions: Vec<String>,
    /// Command line for an external transform; passthrough when unset
    pub transform_command: Option<String>,
    pub stage_config: serde_json::Value,
}

impl WorkerConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Read the environment without touching `.env` or validating
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env(),
            storage: StorageConfig::from_env(),
            staging: StagingConfig::from_env()?,
            stage: StageConfig::from_env()?,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.database.validate()?;
        self.staging.validate()?;
        self.stage.validate()?;
        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            url: env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            min_connections: parse_var("DATABASE_MIN_CONNECTIONS")
                .unwrap_or(DEFAULT_DATABASE_MIN_CONNECTIONS),
            connect_timeout_secs: parse_var("DATABASE_CONNECT_TIMEOUT")
                .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
            idle_timeout_secs: parse_var("DATABASE_IDLE_TIMEOUT")
                .unwrap_or(DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.min_connections > self.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.min_connections,
                self.max_connections
            );
        }

        Ok(())
    }
}

impl StageConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mode = match env::var("MODE") {
            Ok(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            Err(_) => RunMode::default(),
        };

        let stage_config = match env::var("STAGE_CONFIG") {
            Ok(raw) if !raw.trim().is_empty() => {
                serde_json::from_str(&raw).context("STAGE_CONFIG is not valid JSON")?
            }
            _ => serde_json::Value::Object(Default::default()),
        };

        let stage = match env::var("STAGE") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("STAGE must be an integer, got '{raw}'"))?,
            Err(_) => 1,
        };

        Ok(Self {
            dataset_name: env::var("DATASET_ID").unwrap_or_else(|_| "default".to_string()),
            stage,
            input_bucket: env::var("INPUT_BUCKET").unwrap_or_default(),
            input_prefix: env::var("INPUT_PREFIX").unwrap_or_default(),
            output_bucket: env::var("OUTPUT_BUCKET").unwrap_or_default(),
            output_prefix: env::var("OUTPUT_PREFIX").unwrap_or_default(),
            mode,
            poll_interval_secs: parse_var("POLL_INTERVAL").unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            claim_ttl_secs: parse_var("CLAIM_TTL_SECS").unwrap_or(DEFAULT_CLAIM_TTL_SECS),
            heartbeat_interval_secs: parse_var("HEARTBEAT_INTERVAL_SECS")
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            transform_timeout_secs: parse_var("TRANSFORM_TIMEOUT_SECS")
                .unwrap_or(DEFAULT_TRANSFORM_TIMEOUT_SECS),
            max_attempts: parse_var("MAX_ATTEMPTS").unwrap_or(DEFAULT_MAX_ATTEMPTS),
            retry_base_delay_secs: parse_var("RETRY_BASE_DELAY_SECS")
                .unwrap_or(DEFAULT_RETRY_BASE_DELAY_SECS),
            retry_max_delay_secs: parse_var("RETRY_MAX_DELAY_SECS")
                .unwrap_or(DEFAULT_RETRY_MAX_DELAY_SECS),
            concurrency: parse_var("WORKER_CONCURRENCY").unwrap_or(DEFAULT_WORKER_CONCURRENCY),
            allowed_extensions: env::var("ALLOWED_EXTENSIONS")
                .unwrap_or_else(|_| DEFAULT_ALLOWED_EXTENSIONS.to_string())
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            transform_command: env::var("TRANSFORM_COMMAND")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            stage_config,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dataset_name.trim().is_empty() {
            anyhow::bail!("DATASET_ID cannot be empty");
        }

        if self.stage < 1 {
            anyhow::bail!("Stage numbers start at 1, got {}", self.stage);
        }

        // Stage 1 lists raw objects; later stages read manifests only
        if self.stage == 1 && self.input_bucket.is_empty() {
            anyhow::bail!("INPUT_BUCKET is required for stage 1");
        }

        if self.output_bucket.is_empty() {
            anyhow::bail!("OUTPUT_BUCKET cannot be empty");
        }

        if self.claim_ttl_secs == 0 {
            anyhow::bail!("CLAIM_TTL_SECS must be greater than 0");
        }

        if self.heartbeat_interval_secs == 0 || self.heartbeat_interval_secs >= self.claim_ttl_secs
        {
            anyhow::bail!(
                "HEARTBEAT_INTERVAL_SECS ({}) must be positive and shorter than CLAIM_TTL_SECS ({})",
                self.heartbeat_interval_secs,
                self.claim_ttl_secs
            );
        }

        if self.transform_timeout_secs == 0 {
            anyhow::bail!("TRANSFORM_TIMEOUT_SECS must be greater than 0");
        }

        if self.max_attempts < 1 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }

        if self.retry_base_delay_secs > self.retry_max_delay_secs {
            anyhow::bail!(
                "RETRY_BASE_DELAY_SECS ({}) cannot exceed RETRY_MAX_DELAY_SECS ({})",
                self.retry_base_delay_secs,
                self.retry_max_delay_secs
            );
        }

        if self.concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be greater than 0");
        }

        if self.poll_interval_secs == 0 {
            anyhow::bail!("POLL_INTERVAL must be greater than 0");
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_secs(self.retry_base_delay_secs),
            max_backoff: Duration::from_secs(self.retry_max_delay_secs),
        }
    }

    /// Runner settings for a dataset already registered in the store
    pub fn runner_config(&self, dataset_id: Uuid) -> RunnerConfig {
        let mut config = RunnerConfig::new(
            dataset_id,
            self.stage,
            &self.input_bucket,
            &self.output_bucket,
        );
        config.output_prefix = self.output_prefix.clone();
        config.claim_ttl = Duration::from_secs(self.claim_ttl_secs);
        config.heartbeat_interval = Duration::from_secs(self.heartbeat_interval_secs);
        config.transform_timeout = Duration::from_secs(self.transform_timeout_secs);
        config.concurrency = self.concurrency;
        config.poll_interval = Duration::from_secs(self.poll_interval_secs);
        config.allowed_extensions = self.allowed_extensions.clone();
        config.stage_config = self.stage_config.clone();
        config
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const STAGE_VARS: &[&str] = &[
        "DATASET_ID",
        "STAGE",
        "INPUT_BUCKET",
        "INPUT_PREFIX",
        "OUTPUT_BUCKET",
        "OUTPUT_PREFIX",
        "MODE",
        "POLL_INTERVAL",
        "CLAIM_TTL_SECS",
        "HEARTBEAT_INTERVAL_SECS",
        "TRANSFORM_TIMEOUT_SECS",
        "MAX_ATTEMPTS",
        "RETRY_BASE_DELAY_SECS",
        "RETRY_MAX_DELAY_SECS",
        "WORKER_CONCURRENCY",
        "ALLOWED_EXTENSIONS",
        "TRANSFORM_COMMAND",
        "STAGE_CONFIG",
    ];

    fn clear_stage_env() {
        for var in STAGE_VARS {
            env::remove_var(var);
        }
    }

    fn stage_config() -> StageConfig {
        StageConfig {
            dataset_name: "drone-survey".into(),
            stage: 1,
            input_bucket: "raw".into(),
            input_prefix: String::new(),
            output_bucket: "augmented".into(),
            output_prefix: String::new(),
            mode: RunMode::Poll,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            claim_ttl_secs: DEFAULT_CLAIM_TTL_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            transform_timeout_secs: DEFAULT_TRANSFORM_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_secs: DEFAULT_RETRY_BASE_DELAY_SECS,
            retry_max_delay_secs: DEFAULT_RETRY_MAX_DELAY_SECS,
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            allowed_extensions: vec![".jpg".into()],
            transform_command: None,
            stage_config: serde_json::json!({}),
        }
    }

    #[test]
    #[serial]
    fn test_stage_defaults() {
        clear_stage_env();
        env::set_var("INPUT_BUCKET", "raw");
        env::set_var("OUTPUT_BUCKET", "augmented");

        let config = StageConfig::from_env().unwrap();
        assert_eq!(config.stage, 1);
        assert_eq!(config.mode, RunMode::Poll);
        assert_eq!(config.claim_ttl_secs, DEFAULT_CLAIM_TTL_SECS);
        assert_eq!(config.transform_timeout_secs, DEFAULT_TRANSFORM_TIMEOUT_SECS);
        assert_eq!(config.allowed_extensions, vec![".jpg", ".jpeg", ".png"]);
        assert!(config.transform_command.is_none());
        config.validate().unwrap();

        clear_stage_env();
    }

    #[test]
    #[serial]
    fn test_stage_from_env() {
        clear_stage_env();
        env::set_var("DATASET_ID", "drone-survey");
        env::set_var("STAGE", "2");
        env::set_var("OUTPUT_BUCKET", "normalized");
        env::set_var("MODE", "once");
        env::set_var("ALLOWED_EXTENSIONS", ".JPG, .tif");
        env::set_var("STAGE_CONFIG", r#"{"sizes":[640,1280]}"#);
        env::set_var("TRANSFORM_COMMAND", "python3 -m normalize");

        let config = StageConfig::from_env().unwrap();
        assert_eq!(config.stage, 2);
        assert_eq!(config.mode, RunMode::Once);
        assert_eq!(config.allowed_extensions, vec![".jpg", ".tif"]);
        assert_eq!(config.stage_config["sizes"][1], 1280);
        assert_eq!(config.transform_command.as_deref(), Some("python3 -m normalize"));
        // Stage 2 reads manifests, so no input bucket is needed
        config.validate().unwrap();

        clear_stage_env();
    }

    #[test]
    #[serial]
    fn test_bad_stage_config_json() {
        clear_stage_env();
        env::set_var("STAGE_CONFIG", "{not json");
        assert!(StageConfig::from_env().is_err());

        env::set_var("STAGE_CONFIG", "{}");
        env::set_var("MODE", "sometimes");
        assert!(StageConfig::from_env().is_err());

        clear_stage_env();
    }

    #[test]
    fn test_validation_rejects() {
        let mut config = stage_config();
        config.stage = 0;
        assert!(config.validate().is_err());

        let mut config = stage_config();
        config.heartbeat_interval_secs = config.claim_ttl_secs;
        assert!(config.validate().is_err());

        let mut config = stage_config();
        config.transform_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = stage_config();
        config.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = stage_config();
        config.output_bucket.clear();
        assert!(config.validate().is_err());

        let mut config = stage_config();
        config.input_bucket.clear();
        assert!(config.validate().is_err());

        assert!(stage_config().validate().is_ok());
    }

    #[test]
    fn test_runner_config_mapping() {
        let mut config = stage_config();
        config.output_prefix = "batch-7/".into();
        config.claim_ttl_secs = 120;
        config.heartbeat_interval_secs = 20;
        config.transform_timeout_secs = 90;

        let dataset_id = Uuid::new_v4();
        let runner = config.runner_config(dataset_id);
        assert_eq!(runner.dataset_id, dataset_id);
        assert_eq!(runner.claim_ttl, Duration::from_secs(120));
        assert_eq!(runner.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(runner.transform_timeout, Duration::from_secs(90));
        assert_eq!(runner.output_prefix, "batch-7/");

        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_database_validation() {
        let mut db = DatabaseConfig {
            url: DEFAULT_DATABASE_URL.into(),
            max_connections: 2,
            min_connections: 5,
            connect_timeout_secs: 1,
            idle_timeout_secs: 1,
        };
        assert!(db.validate().is_err());
        db.min_connections = 1;
        assert!(db.validate().is_ok());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("POLL".parse::<RunMode>().unwrap(), RunMode::Poll);
        assert!("later".parse::<RunMode>().is_err());
        assert_eq!(RunMode::Once.to_string(), "once");
    }
}

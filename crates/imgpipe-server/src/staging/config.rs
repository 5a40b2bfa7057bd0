use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_NVME_ROOT: &str = "/mnt/nvme";
pub const DEFAULT_NVME_MIN_GB: u64 = 100;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_OUTPUT_HEADROOM: f64 = 2.0;

const GIB: u64 = 1024 * 1024 * 1024;

/// Local scratch disk settings for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    pub root: PathBuf,
    /// `NVME_CAPACITY_GB`, or the free space under `root` at startup
    pub capacity_bytes: u64,
    /// Safety margin that reservations never eat into
    pub min_free_bytes: u64,
    pub acquire_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Recorded in each lease sidecar; matches the claim TTL
    pub lease_ttl: Duration,
    /// Reservation multiplier covering transform outputs
    pub output_headroom: f64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_NVME_ROOT),
            capacity_bytes: 0,
            min_free_bytes: DEFAULT_NVME_MIN_GB * GIB,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(300),
            output_headroom: DEFAULT_OUTPUT_HEADROOM,
        }
    }
}

impl StagingConfig {
    /// Read `NVME_*` variables; malformed values are errors, not defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let root = env::var("NVME_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.root);

        let capacity_bytes = match env_var("NVME_CAPACITY_GB")? {
            Some(gb) => gib("NVME_CAPACITY_GB", gb)?,
            None => available_space(&root).with_context(|| {
                format!(
                    "Cannot read free space under {}; set NVME_CAPACITY_GB",
                    root.display()
                )
            })?,
        };
        let min_free_bytes = match env_var("NVME_MIN_GB")? {
            Some(gb) => gib("NVME_MIN_GB", gb)?,
            None => defaults.min_free_bytes,
        };

        Ok(Self {
            root,
            capacity_bytes,
            min_free_bytes,
            acquire_timeout: env_var("NVME_ACQUIRE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
            output_headroom: env_var("NVME_OUTPUT_HEADROOM")?.unwrap_or(defaults.output_headroom),
            ..defaults
        })
    }

    /// A small config rooted at `root`, for tests and dry runs
    pub fn for_testing(root: impl Into<PathBuf>, capacity_bytes: u64, min_free_bytes: u64) -> Self {
        Self {
            root: root.into(),
            capacity_bytes,
            min_free_bytes,
            acquire_timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            lease_ttl: Duration::from_secs(30),
            output_headroom: 1.0,
        }
    }

    /// Bytes that leases may reserve in total
    pub fn reservable_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.min_free_bytes)
    }

    pub fn leases_dir(&self) -> PathBuf {
        self.root.join("leases")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.capacity_bytes <= self.min_free_bytes {
            anyhow::bail!(
                "NVMe capacity ({} bytes) must exceed the safety margin ({} bytes)",
                self.capacity_bytes,
                self.min_free_bytes
            );
        }
        if !(self.output_headroom.is_finite() && self.output_headroom >= 1.0) {
            anyhow::bail!("NVME_OUTPUT_HEADROOM must be >= 1.0, got {}", self.output_headroom);
        }
        Ok(())
    }
}

fn env_var<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{name} is invalid ('{raw}'): {e}")),
        Err(_) => Ok(None),
    }
}

fn gib(name: &str, gb: u64) -> anyhow::Result<u64> {
    gb.checked_mul(GIB)
        .with_context(|| format!("{name}={gb} does not fit in a byte count"))
}

/// Bytes an unprivileged process may still write under `root`
#[cfg(unix)]
fn available_space(root: &Path) -> anyhow::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(root)?;
    #[allow(clippy::unnecessary_cast)]
    Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
}

#[cfg(not(unix))]
fn available_space(_root: &Path) -> anyhow::Result<u64> {
    anyhow::bail!("free space detection is only supported on unix")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_reservable_bytes() {
        let config = StagingConfig::for_testing("/tmp/x", 1000, 100);
        assert_eq!(config.reservable_bytes(), 900);
        assert!(config.validate().is_ok());

        let bad = StagingConfig::for_testing("/tmp/x", 100, 100);
        assert!(bad.validate().is_err());
    }

    const NVME_VARS: &[&str] = &[
        "NVME_ROOT",
        "NVME_CAPACITY_GB",
        "NVME_MIN_GB",
        "NVME_ACQUIRE_TIMEOUT_SECS",
        "NVME_OUTPUT_HEADROOM",
    ];

    fn clear_nvme_env() {
        for var in NVME_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_nvme_env();
        env::set_var("NVME_ROOT", "/scratch");
        env::set_var("NVME_CAPACITY_GB", "200");
        env::set_var("NVME_MIN_GB", "20");

        let config = StagingConfig::from_env().unwrap();
        assert_eq!(config.root, PathBuf::from("/scratch"));
        assert_eq!(config.capacity_bytes, 200 * GIB);
        assert_eq!(config.min_free_bytes, 20 * GIB);

        clear_nvme_env();
    }

    #[test]
    #[serial]
    fn test_capacity_defaults_to_free_space() {
        clear_nvme_env();
        let dir = tempfile::tempdir().unwrap();
        env::set_var("NVME_ROOT", dir.path());

        let config = StagingConfig::from_env().unwrap();
        assert!(config.capacity_bytes > 0);

        env::set_var("NVME_ROOT", dir.path().join("missing"));
        let err = StagingConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("NVME_CAPACITY_GB"));

        clear_nvme_env();
    }

    #[test]
    #[serial]
    fn test_malformed_values_are_rejected() {
        clear_nvme_env();
        env::set_var("NVME_CAPACITY_GB", "abc");
        assert!(StagingConfig::from_env().is_err());

        env::set_var("NVME_CAPACITY_GB", "200");
        env::set_var("NVME_OUTPUT_HEADROOM", "lots");
        assert!(StagingConfig::from_env().is_err());

        clear_nvme_env();
    }

    #[test]
    #[serial]
    fn test_huge_capacity_is_rejected() {
        clear_nvme_env();
        env::set_var("NVME_CAPACITY_GB", u64::MAX.to_string());
        let err = StagingConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("NVME_CAPACITY_GB"));

        env::set_var("NVME_CAPACITY_GB", "200");
        env::set_var("NVME_MIN_GB", (u64::MAX / 2).to_string());
        assert!(StagingConfig::from_env().is_err());

        clear_nvme_env();
    }
}

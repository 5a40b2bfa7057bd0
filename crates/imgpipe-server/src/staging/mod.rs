//! NVMe staging coordinator
//!
//! Hands out [`StagingLease`]s over a node-local scratch disk. Space is
//! reserved pessimistically before any byte is copied, against a single
//! atomic counter capped at `capacity - min_free`. A lease gives back its
//! reservation and deletes its directory when released or dropped, so a
//! failing or panicking stage never leaks disk.
//!
//! Layout under the staging root:
//!
//! ```text
//! <root>/leases/<lease_id>/lease.json
//! <root>/leases/<lease_id>/input/
//! <root>/leases/<lease_id>/output/
//! ```
//!
//! `lease.json` lets [`NvmeStagingCoordinator::reconcile`] map directories
//! left behind by a crashed process back to their stage records.

use chrono::{DateTime, Utc};
use imgpipe_common::checksum::sha256_bytes;
use imgpipe_common::types::StoredObject;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::manifest::{ManifestError, ManifestStore};
use crate::storage::{ObjectStoreGateway, ObjectUri, StorageError};

pub mod config;

pub use config::StagingConfig;

pub const LEASE_SIDECAR: &str = "lease.json";

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Staging capacity exceeded: requested {requested} bytes, {available} available")]
    CapacityExceeded { requested: u64, available: u64 },

    #[error("Integrity check failed for {uri}: expected {expected}, got {actual}")]
    IntegrityError {
        uri: String,
        expected: String,
        actual: String,
    },

    #[error("Staged path {0} is outside the lease directory")]
    OutsideLease(PathBuf),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Staging I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lease sidecar error: {0}")]
    Sidecar(#[from] serde_json::Error),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

pub type StagingResult<T> = Result<T, StagingError>;

/// Contents of `lease.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseSidecar {
    pub lease_id: Uuid,
    pub dataset_id: Uuid,
    pub stage: i32,
    pub key: String,
    pub bytes_reserved: u64,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

/// A file copied into a lease and verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub uri: ObjectUri,
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
}

/// Outcome of a reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub removed: usize,
    pub retained: usize,
    pub freed_bytes: u64,
    pub retained_bytes: u64,
}

struct Shared {
    config: StagingConfig,
    reserved: AtomicU64,
    active: Mutex<HashSet<Uuid>>,
    /// Reservations taken by reconcile for orphans whose claim is still live
    orphans: Mutex<HashMap<Uuid, u64>>,
}

impl Shared {
    fn limit(&self) -> u64 {
        self.config.reservable_bytes()
    }

    fn try_reserve(&self, bytes: u64) -> bool {
        let limit = self.limit();
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let Some(next) = current.checked_add(bytes).filter(|n| *n <= limit) else {
                return false;
            };
            match self.reserved.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Reserve as much of `bytes` as fits under the limit; returns the
    /// amount taken
    fn reserve_clamped(&self, bytes: u64) -> u64 {
        let limit = self.limit();
        let mut taken = 0;
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                taken = bytes.min(limit.saturating_sub(cur));
                Some(cur + taken)
            });
        taken
    }

    fn unreserve(&self, bytes: u64) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }

    fn available(&self) -> u64 {
        self.limit()
            .saturating_sub(self.reserved.load(Ordering::Acquire))
    }

    fn active(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn orphans(&self) -> MutexGuard<'_, HashMap<Uuid, u64>> {
        self.orphans.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive scratch space for one (dataset, stage, key)
///
/// Dropping the lease releases it. Prefer [`NvmeStagingCoordinator::release`]
/// on the happy path so directory removal runs off the async executor.
pub struct StagingLease {
    lease_id: Uuid,
    dataset_id: Uuid,
    stage: i32,
    key: String,
    local_path: PathBuf,
    bytes_reserved: u64,
    acquired_at: DateTime<Utc>,
    ttl: Duration,
    staged: Vec<StagedFile>,
    shared: Arc<Shared>,
    released: bool,
}

impl std::fmt::Debug for StagingLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingLease")
            .field("lease_id", &self.lease_id)
            .field("key", &self.key)
            .field("local_path", &self.local_path)
            .field("bytes_reserved", &self.bytes_reserved)
            .finish()
    }
}

impl StagingLease {
    pub fn lease_id(&self) -> Uuid {
        self.lease_id
    }

    pub fn dataset_id(&self) -> Uuid {
        self.dataset_id
    }

    pub fn stage(&self) -> i32 {
        self.stage
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn input_dir(&self) -> PathBuf {
        self.local_path.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.local_path.join("output")
    }

    pub fn bytes_reserved(&self) -> u64 {
        self.bytes_reserved
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Files staged in so far, in copy order
    pub fn staged_files(&self) -> &[StagedFile] {
        &self.staged
    }

    fn sidecar(&self) -> LeaseSidecar {
        LeaseSidecar {
            lease_id: self.lease_id,
            dataset_id: self.dataset_id,
            stage: self.stage,
            key: self.key.clone(),
            bytes_reserved: self.bytes_reserved,
            acquired_at: self.acquired_at,
            ttl_secs: self.ttl.as_secs(),
        }
    }

    async fn write_sidecar(&self) -> StagingResult<()> {
        let json = serde_json::to_vec_pretty(&self.sidecar())?;
        tokio::fs::write(self.local_path.join(LEASE_SIDECAR), json).await?;
        Ok(())
    }

    fn give_back(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.unreserve(self.bytes_reserved);
        self.shared.active().remove(&self.lease_id);
    }

    fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.local_path)
    }
}

impl Drop for StagingLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.local_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(lease_id = %self.lease_id, error = %e, "Failed to remove lease directory on drop");
            }
        }
        self.give_back();
        debug!(lease_id = %self.lease_id, "Lease released on drop");
    }
}

/// Node-local scratch space manager
#[derive(Clone)]
pub struct NvmeStagingCoordinator {
    shared: Arc<Shared>,
    gateway: Arc<dyn ObjectStoreGateway>,
}

impl NvmeStagingCoordinator {
    pub fn new(config: StagingConfig, gateway: Arc<dyn ObjectStoreGateway>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                reserved: AtomicU64::new(0),
                active: Mutex::new(HashSet::new()),
                orphans: Mutex::new(HashMap::new()),
            }),
            gateway,
        }
    }

    pub fn config(&self) -> &StagingConfig {
        &self.shared.config
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.shared.reserved.load(Ordering::Acquire)
    }

    pub fn available_bytes(&self) -> u64 {
        self.shared.available()
    }

    pub fn active_leases(&self) -> usize {
        self.shared.active().len()
    }

    /// Reserve `bytes`, retrying with exponential backoff until the
    /// acquire timeout runs out
    async fn reserve_with_backoff(&self, bytes: u64) -> StagingResult<()> {
        let config = &self.shared.config;
        if bytes > self.shared.limit() {
            return Err(StagingError::CapacityExceeded {
                requested: bytes,
                available: self.available_bytes(),
            });
        }

        let deadline = Instant::now() + config.acquire_timeout;
        let mut delay = config.initial_backoff;

        loop {
            if self.shared.try_reserve(bytes) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StagingError::CapacityExceeded {
                    requested: bytes,
                    available: self.available_bytes(),
                });
            }
            debug!(bytes, ?delay, "Staging space busy, backing off");
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(config.max_backoff);
        }
    }

    /// Reserve space for one key's input and create its lease directory
    #[instrument(skip(self))]
    pub async fn acquire_input_space(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
        estimated_bytes: u64,
    ) -> StagingResult<StagingLease> {
        self.reserve_with_backoff(estimated_bytes).await?;

        let lease_id = Uuid::new_v4();
        self.shared.active().insert(lease_id);

        // From here on the lease's Drop undoes the reservation
        let lease = StagingLease {
            lease_id,
            dataset_id,
            stage,
            key: key.to_string(),
            local_path: self.shared.config.leases_dir().join(lease_id.to_string()),
            bytes_reserved: estimated_bytes,
            acquired_at: Utc::now(),
            ttl: self.shared.config.lease_ttl,
            staged: Vec::new(),
            shared: Arc::clone(&self.shared),
            released: false,
        };

        tokio::fs::create_dir_all(lease.input_dir()).await?;
        tokio::fs::create_dir_all(lease.output_dir()).await?;
        lease.write_sidecar().await?;

        debug!(%lease_id, reserved = self.reserved_bytes(), "Lease acquired");
        Ok(lease)
    }

    /// Reserve `extra` more bytes for an existing lease
    pub async fn grow(&self, lease: &mut StagingLease, extra: u64) -> StagingResult<()> {
        if extra == 0 {
            return Ok(());
        }
        self.reserve_with_backoff(extra).await?;
        lease.bytes_reserved += extra;
        lease.write_sidecar().await?;
        debug!(lease_id = %lease.lease_id, extra, total = lease.bytes_reserved, "Lease grown");
        Ok(())
    }

    /// Download `remote` into the lease's input directory and verify it
    /// against the object's size and checksum
    #[instrument(skip(self, lease), fields(lease_id = %lease.lease_id, uri = %remote))]
    pub async fn copy_in(
        &self,
        lease: &mut StagingLease,
        remote: &ObjectUri,
    ) -> StagingResult<StagedFile> {
        let stat = self.gateway.stat(remote).await?;

        let used: u64 = lease.staged.iter().map(|f| f.size).sum();
        let needed = used.saturating_add(stat.size);
        if needed > lease.bytes_reserved {
            self.grow(lease, needed - lease.bytes_reserved).await?;
        }

        let data = self.gateway.get(remote).await?;
        if data.len() as u64 != stat.size {
            return Err(StagingError::IntegrityError {
                uri: remote.to_string(),
                expected: format!("{} bytes", stat.size),
                actual: format!("{} bytes", data.len()),
            });
        }

        let checksum = sha256_bytes(&data);
        if let Some(expected) = &stat.checksum {
            if !expected.eq_ignore_ascii_case(&checksum) {
                return Err(StagingError::IntegrityError {
                    uri: remote.to_string(),
                    expected: expected.clone(),
                    actual: checksum,
                });
            }
        }

        let path = unique_path(&lease.input_dir(), remote.file_name(), lease.staged.len());
        tokio::fs::write(&path, &data).await?;

        let on_disk = tokio::fs::metadata(&path).await?.len();
        if on_disk != stat.size {
            return Err(StagingError::IntegrityError {
                uri: path.display().to_string(),
                expected: format!("{} bytes", stat.size),
                actual: format!("{on_disk} bytes"),
            });
        }

        let staged = StagedFile {
            uri: remote.clone(),
            path,
            size: stat.size,
            checksum,
        };
        lease.staged.push(staged.clone());
        debug!(bytes = staged.size, "Staged input");
        Ok(staged)
    }

    /// Upload a file from the lease and verify a round-trip read
    #[instrument(skip(self, lease), fields(lease_id = %lease.lease_id, uri = %remote))]
    pub async fn copy_out(
        &self,
        lease: &StagingLease,
        local_path: &Path,
        remote: &ObjectUri,
    ) -> StagingResult<StoredObject> {
        if !lease.contains(local_path) {
            return Err(StagingError::OutsideLease(local_path.to_path_buf()));
        }

        let data = tokio::fs::read(local_path).await?;
        let size = data.len() as u64;
        let checksum = sha256_bytes(&data);

        let stat = self.gateway.put(remote, data).await?;
        if stat.size != size {
            return Err(StagingError::IntegrityError {
                uri: remote.to_string(),
                expected: format!("{size} bytes"),
                actual: format!("{} bytes", stat.size),
            });
        }

        let round_trip = sha256_bytes(&self.gateway.get(remote).await?);
        if round_trip != checksum {
            return Err(StagingError::IntegrityError {
                uri: remote.to_string(),
                expected: checksum,
                actual: round_trip,
            });
        }

        debug!(bytes = size, "Uploaded output");
        Ok(StoredObject {
            uri: remote.to_string(),
            size,
            checksum,
        })
    }

    /// Delete the lease directory and give back its reservation
    pub async fn release(&self, mut lease: StagingLease) -> StagingResult<()> {
        let removed = match tokio::fs::remove_dir_all(&lease.local_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
        lease.give_back();
        debug!(lease_id = %lease.lease_id, reserved = self.reserved_bytes(), "Lease released");
        Ok(removed?)
    }

    /// Clean up lease directories that no live lease in this process owns
    ///
    /// A directory whose key still has a live claim in the store is kept
    /// and its bytes stay reserved until a later pass finds the claim gone.
    #[instrument(skip(self, store))]
    pub async fn reconcile(&self, store: &dyn ManifestStore) -> StagingResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let leases_dir = self.shared.config.leases_dir();

        let mut dir = match tokio::fs::read_dir(&leases_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        let now = store.now().await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(lease_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| Uuid::parse_str(n).ok())
            else {
                continue;
            };
            if self.shared.active().contains(&lease_id) {
                continue;
            }
            report.scanned += 1;

            let sidecar = read_sidecar(&path).await;
            let live = match &sidecar {
                Some(s) => store
                    .get_record(s.dataset_id, s.stage, &s.key)
                    .await?
                    .is_some_and(|r| r.claim_is_live(now)),
                None => false,
            };
            let bytes = sidecar.as_ref().map_or(0, |s| s.bytes_reserved);

            if live {
                // Reserve once per orphan, however many passes see it
                let mut orphans = self.shared.orphans();
                if let std::collections::hash_map::Entry::Vacant(slot) = orphans.entry(lease_id) {
                    let held = self.shared.reserve_clamped(bytes);
                    if held < bytes {
                        warn!(%lease_id, bytes, held, "Orphaned lease exceeds reservable space");
                    }
                    slot.insert(held);
                }
                report.retained += 1;
                report.retained_bytes += bytes;
                continue;
            }

            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let previously_held = self.shared.orphans().remove(&lease_id);
            if let Some(held) = previously_held {
                self.shared.unreserve(held);
            }
            report.removed += 1;
            report.freed_bytes += bytes;
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                removed = report.removed,
                retained = report.retained,
                freed_bytes = report.freed_bytes,
                "Staging reconcile finished"
            );
        }
        Ok(report)
    }
}

async fn read_sidecar(lease_dir: &Path) -> Option<LeaseSidecar> {
    let bytes = tokio::fs::read(lease_dir.join(LEASE_SIDECAR)).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(sidecar) => Some(sidecar),
        Err(e) => {
            warn!(path = %lease_dir.display(), error = %e, "Unreadable lease sidecar");
            None
        }
    }
}

/// `dir/name`, or `dir/<n>-name` when two inputs share a file name
fn unique_path(dir: &Path, name: &str, n: usize) -> PathBuf {
    let name = if name.is_empty() { "object" } else { name };
    let candidate = dir.join(name);
    if candidate.exists() {
        dir.join(format!("{n}-{name}"))
    } else {
        candidate
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::{InMemoryManifestStore, ManualClock, RetryPolicy};
    use crate::storage::InMemoryObjectStore;

    fn coordinator(root: &Path, capacity: u64, margin: u64) -> (NvmeStagingCoordinator, Arc<InMemoryObjectStore>) {
        let gateway = Arc::new(InMemoryObjectStore::new());
        let config = StagingConfig::for_testing(root, capacity, margin);
        (NvmeStagingCoordinator::new(config, gateway.clone()), gateway)
    }

    #[tokio::test]
    async fn test_reservations_respect_margin() {
        let dir = tempfile::tempdir().unwrap();
        let (staging, _) = coordinator(dir.path(), 1000, 100);
        let ds = Uuid::new_v4();

        let a = staging.acquire_input_space(ds, 1, "a.jpg", 600).await.unwrap();
        assert_eq!(staging.reserved_bytes(), 600);
        assert_eq!(staging.available_bytes(), 300);

        let err = staging.acquire_input_space(ds, 1, "b.jpg", 400).await.unwrap_err();
        assert!(matches!(err, StagingError::CapacityExceeded { requested: 400, .. }));

        staging.release(a).await.unwrap();
        assert_eq!(staging.reserved_bytes(), 0);
        let b = staging.acquire_input_space(ds, 1, "b.jpg", 400).await.unwrap();
        assert_eq!(staging.active_leases(), 1);
        drop(b);
        assert_eq!(staging.active_leases(), 0);
    }

    #[tokio::test]
    async fn test_oversized_request_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (staging, _) = coordinator(dir.path(), 1000, 100);
        let err = staging
            .acquire_input_space(Uuid::new_v4(), 1, "huge.png", 901)
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::CapacityExceeded { .. }));
    }

    #[tokio::test]
    async fn test_waiting_acquire_succeeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let (staging, _) = coordinator(dir.path(), 1000, 100);
        let ds = Uuid::new_v4();
        let held = staging.acquire_input_space(ds, 1, "a.jpg", 900).await.unwrap();

        let waiter = {
            let staging = staging.clone();
            tokio::spawn(async move { staging.acquire_input_space(ds, 1, "b.jpg", 500).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(held);

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.bytes_reserved(), 500);
    }

    #[tokio::test]
    async fn test_drop_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (staging, _) = coordinator(dir.path(), 1000, 100);
        let lease = staging
            .acquire_input_space(Uuid::new_v4(), 1, "a.jpg", 10)
            .await
            .unwrap();
        let path = lease.local_path().to_path_buf();
        assert!(path.join(LEASE_SIDECAR).exists());
        assert!(lease.input_dir().is_dir());

        drop(lease);
        assert!(!path.exists());
        assert_eq!(staging.reserved_bytes(), 0);
    }

    #[tokio::test]
    async fn test_copy_in_verifies_and_grows() {
        let dir = tempfile::tempdir().unwrap();
        let (staging, gateway) = coordinator(dir.path(), 1000, 100);
        let uri: ObjectUri = "s3://raw/a.jpg".parse().unwrap();
        gateway.insert(&uri, vec![1u8; 64]);

        let mut lease = staging
            .acquire_input_space(Uuid::new_v4(), 1, "a.jpg", 16)
            .await
            .unwrap();
        let staged = staging.copy_in(&mut lease, &uri).await.unwrap();

        assert_eq!(staged.size, 64);
        assert_eq!(std::fs::read(&staged.path).unwrap(), vec![1u8; 64]);
        assert_eq!(lease.bytes_reserved(), 64);
        assert_eq!(staging.reserved_bytes(), 64);
    }

    #[tokio::test]
    async fn test_copy_in_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let (staging, gateway) = coordinator(dir.path(), 1000, 100);
        let uri: ObjectUri = "s3://raw/a.jpg".parse().unwrap();
        gateway.insert(&uri, b"original".to_vec());
        gateway.corrupt(&uri, b"0riginal".to_vec());

        let mut lease = staging
            .acquire_input_space(Uuid::new_v4(), 1, "a.jpg", 8)
            .await
            .unwrap();
        let err = staging.copy_in(&mut lease, &uri).await.unwrap_err();
        assert!(matches!(err, StagingError::IntegrityError { .. }));
    }

    #[tokio::test]
    async fn test_copy_out_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (staging, gateway) = coordinator(dir.path(), 1000, 100);
        let lease = staging
            .acquire_input_space(Uuid::new_v4(), 1, "a.jpg", 8)
            .await
            .unwrap();
        let local = lease.output_dir().join("a_aug.jpg");
        std::fs::write(&local, b"augmented").unwrap();

        let uri: ObjectUri = "s3://aug/a_aug.jpg".parse().unwrap();
        let stored = staging.copy_out(&lease, &local, &uri).await.unwrap();
        assert_eq!(stored.size, 9);
        assert_eq!(stored.checksum, sha256_bytes(b"augmented"));
        assert_eq!(gateway.object(&uri).unwrap(), b"augmented");

        let outside = dir.path().join("elsewhere.jpg");
        std::fs::write(&outside, b"x").unwrap();
        assert!(matches!(
            staging.copy_out(&lease, &outside, &uri).await,
            Err(StagingError::OutsideLease(_))
        ));
    }

    async fn orphan_with_live_claim(
        root: &Path,
        bytes: u64,
    ) -> (Arc<InMemoryManifestStore>, ManualClock, Uuid) {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryManifestStore::with_clock(
            RetryPolicy::default(),
            Arc::new(clock.clone()),
        ));
        let dataset = store.register_dataset("drone-survey").await.unwrap();
        store
            .claim_for_processing(dataset.id, 1, "a.jpg", Duration::from_secs(30), "crashed")
            .await
            .unwrap();

        // A previous process died holding this lease
        let (previous, _) = coordinator(root, 10_000, 100);
        let lease = previous
            .acquire_input_space(dataset.id, 1, "a.jpg", bytes)
            .await
            .unwrap();
        let lease_id = lease.lease_id();
        std::mem::forget(lease);

        (store, clock, lease_id)
    }

    #[tokio::test]
    async fn test_reconcile_retains_live_orphan_until_claim_expires() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock, lease_id) = orphan_with_live_claim(dir.path(), 300).await;
        let lease_dir = dir.path().join("leases").join(lease_id.to_string());

        let (staging, _) = coordinator(dir.path(), 1000, 100);
        let report = staging.reconcile(store.as_ref()).await.unwrap();
        assert_eq!(report.retained, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(staging.reserved_bytes(), 300);
        assert!(lease_dir.exists());

        // A second pass does not reserve the same orphan twice
        staging.reconcile(store.as_ref()).await.unwrap();
        assert_eq!(staging.reserved_bytes(), 300);

        clock.advance(Duration::from_secs(31));
        let report = staging.reconcile(store.as_ref()).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.freed_bytes, 300);
        assert_eq!(staging.reserved_bytes(), 0);
        assert!(!lease_dir.exists());
    }

    #[tokio::test]
    async fn test_reconcile_never_reserves_past_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock, _) = orphan_with_live_claim(dir.path(), 5_000).await;

        let (staging, _) = coordinator(dir.path(), 1000, 100);
        let report = staging.reconcile(store.as_ref()).await.unwrap();
        assert_eq!(report.retained, 1);
        assert_eq!(staging.reserved_bytes(), 900);
        assert_eq!(staging.available_bytes(), 0);

        clock.advance(Duration::from_secs(31));
        staging.reconcile(store.as_ref()).await.unwrap();
        assert_eq!(staging.reserved_bytes(), 0);
    }
}

//! Manifest and lineage store
//!
//! The store is the only synchronization point between workers. It holds
//! datasets, one [`StageRecord`] per (dataset, stage, key) and the
//! immutable manifests that record what each stage produced for each key.
//!
//! Claims are leases: `claim_for_processing` hands out a fresh token with an
//! expiry, `heartbeat` extends it, and every later transition names the
//! token. A token that no longer owns its record gets
//! [`ManifestError::ClaimLost`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use imgpipe_common::types::{
    Dataset, FailureAction, Manifest, ManifestEntry, OutputIntent, RecordState, StageRecord,
    StageSummary,
};
use imgpipe_common::CommonError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryManifestStore, ManualClock};
pub use postgres::PgManifestStore;

/// Default page size for [`ManifestStore::query_unprocessed`]
pub const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Key '{key}' is already claimed by {holder:?} until {expires_at:?}")]
    AlreadyClaimed {
        key: String,
        holder: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },

    #[error("Key '{key}' is {state} and cannot be claimed")]
    NotClaimable { key: String, state: RecordState },

    #[error("Key '{key}' is backing off until {not_before}")]
    BackingOff {
        key: String,
        not_before: DateTime<Utc>,
    },

    #[error("Claim {0} no longer owns its record")]
    ClaimLost(Uuid),

    #[error("Manifest for '{key}' already published with hash {existing_hash}, refusing {attempted_hash}")]
    Conflict {
        key: String,
        existing_hash: String,
        attempted_hash: String,
    },

    #[error("Manifest content hash mismatch: caller sent {supplied}, entries hash to {computed}")]
    HashMismatch { supplied: String, computed: String },

    #[error("No manifest published for '{key}' at stage {stage}")]
    NotPublished { key: String, stage: i32 },

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("No stage {stage} record for '{key}'")]
    RecordNotFound { key: String, stage: i32 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl ManifestError {
    /// Failures that say nothing about the key itself
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

pub type ManifestResult<T> = Result<T, ManifestError>;

/// A successful claim
#[derive(Debug, Clone)]
pub struct Claim {
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
    pub record: StageRecord,
}

/// Attempt ceiling and backoff schedule applied by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next claim after `attempt` failed attempts
    pub fn backoff_for(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, attempt_count: i32) -> bool {
        attempt_count >= self.max_attempts
    }
}

/// Durable record of datasets, per-stage key state and published manifests
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// The store's clock. Claim expiry and backoff are judged against it.
    async fn now(&self) -> ManifestResult<DateTime<Utc>>;

    /// Get-or-create a dataset by name
    async fn register_dataset(&self, name: &str) -> ManifestResult<Dataset>;

    async fn get_dataset_by_name(&self, name: &str) -> ManifestResult<Option<Dataset>>;

    async fn list_datasets(&self) -> ManifestResult<Vec<Dataset>>;

    /// Create Pending records for newly discovered keys; existing records
    /// are untouched. Returns how many records were created.
    async fn register_pending(
        &self,
        dataset_id: Uuid,
        stage: i32,
        keys: &[String],
    ) -> ManifestResult<u64>;

    /// Take exclusive ownership of (dataset, stage, key) for `ttl`
    async fn claim_for_processing(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
        ttl: Duration,
        worker_id: &str,
    ) -> ManifestResult<Claim>;

    /// Extend a live claim, returning the new expiry
    async fn heartbeat(&self, token: Uuid, ttl: Duration) -> ManifestResult<DateTime<Utc>>;

    async fn mark_staged(&self, token: Uuid) -> ManifestResult<()>;

    /// Remember uploaded outputs so a reclaiming worker can adopt them
    async fn record_output_intent(&self, token: Uuid, intent: &OutputIntent)
        -> ManifestResult<()>;

    /// Publish the manifest for one key. Identical content is a no-op that
    /// returns the existing manifest; different content is a `Conflict`.
    async fn publish_manifest(
        &self,
        dataset_id: Uuid,
        stage: i32,
        source_key: &str,
        entries: &[ManifestEntry],
        content_hash: &str,
    ) -> ManifestResult<Manifest>;

    /// Claimed/Staged -> Processed; requires the manifest to exist
    async fn mark_processed(&self, token: Uuid) -> ManifestResult<StageRecord>;

    /// Record a failed attempt and release the claim
    async fn fail(
        &self,
        token: Uuid,
        error: &str,
        action: FailureAction,
    ) -> ManifestResult<StageRecord>;

    /// Release the claim back to Pending without spending an attempt
    async fn requeue(&self, token: Uuid, reason: &str) -> ManifestResult<StageRecord>;

    async fn get_record(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
    ) -> ManifestResult<Option<StageRecord>>;

    async fn get_manifest(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
    ) -> ManifestResult<Option<Manifest>>;

    /// One page of unprocessed keys, ordered, strictly after `start_after`
    async fn unprocessed_page(
        &self,
        dataset_id: Uuid,
        stage: i32,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> ManifestResult<Vec<String>>;

    /// Every manifest of the dataset ordered by stage, then key
    async fn get_manifest_chain(&self, dataset_id: Uuid) -> ManifestResult<Vec<Manifest>>;

    /// Manifests of one key across all stages
    async fn get_key_lineage(&self, dataset_id: Uuid, key: &str) -> ManifestResult<Vec<Manifest>>;

    async fn list_dead(
        &self,
        dataset_id: Uuid,
        stage: Option<i32>,
    ) -> ManifestResult<Vec<StageRecord>>;

    /// Operator action: Dead -> Pending with a fresh attempt budget
    async fn revive(&self, dataset_id: Uuid, stage: i32, key: &str)
        -> ManifestResult<StageRecord>;

    async fn stage_summary(&self, dataset_id: Uuid, stage: i32) -> ManifestResult<StageSummary>;

    /// Lazy, restartable sequence of keys lacking a Processed (or Dead)
    /// record for `stage`. Pages are fetched as the stream is polled.
    fn query_unprocessed<'a>(
        &'a self,
        dataset_id: Uuid,
        stage: i32,
        prefix: &'a str,
        start_after: Option<String>,
        page_size: usize,
    ) -> BoxStream<'a, ManifestResult<String>> {
        let page_size = page_size.max(1);

        // Outer None: exhausted. Inner value: cursor for the next page.
        stream::try_unfold(Some(start_after), move |cursor| async move {
            let Some(cursor) = cursor else {
                return Ok::<_, ManifestError>(None);
            };
            let page = self
                .unprocessed_page(dataset_id, stage, prefix, cursor.as_deref(), page_size)
                .await?;
            if page.is_empty() {
                return Ok(None);
            }
            let next = if page.len() < page_size {
                None
            } else {
                Some(page.last().cloned())
            };
            Ok(Some((page, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }
}

/// Validate arguments shared by both store implementations
pub(crate) fn check_stage(stage: i32) -> ManifestResult<()> {
    if stage < 1 {
        return Err(ManifestError::InvalidInput(format!(
            "stage must be >= 1, got {stage}"
        )));
    }
    Ok(())
}

/// Recompute and compare the caller's content hash
pub(crate) fn verify_content_hash(
    entries: &[ManifestEntry],
    supplied: &str,
) -> ManifestResult<String> {
    let computed = imgpipe_common::checksum::manifest_content_hash(entries)?;
    if !computed.eq_ignore_ascii_case(supplied) {
        return Err(ManifestError::HashMismatch {
            supplied: supplied.to_string(),
            computed,
        });
    }
    Ok(computed)
}

/// Where a failed attempt leaves the record: new state and retry time
pub(crate) fn failure_transition(
    policy: &RetryPolicy,
    attempt_count: i32,
    action: FailureAction,
    now: DateTime<Utc>,
) -> (RecordState, Option<DateTime<Utc>>) {
    match action {
        FailureAction::Park => (RecordState::Dead, None),
        _ if policy.exhausted(attempt_count) => (RecordState::Dead, None),
        FailureAction::RetryImmediately => (RecordState::Pending, None),
        FailureAction::RetryWithBackoff => (
            RecordState::Failed,
            Some(now + to_chrono(policy.backoff_for(attempt_count))),
        ),
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

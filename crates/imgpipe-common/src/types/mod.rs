//! Domain types shared by the manifest store, the staging coordinator and
//! the stage runner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CommonError;

/// A logical dataset, created once per name and immutable afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Stage records
// ============================================================================

/// Processing state of one object key within one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    Claimed,
    Staged,
    Processed,
    Failed,
    Dead,
}

impl RecordState {
    pub const ALL: [RecordState; 6] = [
        RecordState::Pending,
        RecordState::Claimed,
        RecordState::Staged,
        RecordState::Processed,
        RecordState::Failed,
        RecordState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Claimed => "claimed",
            RecordState::Staged => "staged",
            RecordState::Processed => "processed",
            RecordState::Failed => "failed",
            RecordState::Dead => "dead",
        }
    }

    /// Claimed and Staged records carry a claim token
    pub fn holds_claim(&self) -> bool {
        matches!(self, RecordState::Claimed | RecordState::Staged)
    }

    /// Processed and Dead never leave their state without operator action
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordState::Processed | RecordState::Dead)
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordState {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordState::Pending),
            "claimed" => Ok(RecordState::Claimed),
            "staged" => Ok(RecordState::Staged),
            "processed" => Ok(RecordState::Processed),
            "failed" => Ok(RecordState::Failed),
            "dead" => Ok(RecordState::Dead),
            other => Err(CommonError::InvalidState(other.to_string())),
        }
    }
}

/// Per (dataset, stage, object key) processing record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub stage: i32,
    pub object_key: String,
    pub state: RecordState,
    pub claim_token: Option<Uuid>,
    pub claim_expiry: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    /// Earliest time a Failed record may be claimed again
    pub not_before: Option<DateTime<Utc>>,
    /// Outputs uploaded by a previous attempt that never got published
    pub output_intent: Option<OutputIntent>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    /// True while some worker holds a claim that has not expired at `now`
    pub fn claim_is_live(&self, now: DateTime<Utc>) -> bool {
        self.state.holds_claim() && self.claim_expiry.is_some_and(|expiry| expiry > now)
    }

    /// True when a claim attempt at `now` may succeed
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            RecordState::Pending => true,
            RecordState::Failed => self.not_before.is_none_or(|t| t <= now),
            RecordState::Claimed | RecordState::Staged => !self.claim_is_live(now),
            RecordState::Processed | RecordState::Dead => false,
        }
    }
}

/// What to do with a claimed record after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Failed with a backoff window, Dead once attempts are exhausted
    RetryWithBackoff,
    /// Back to Pending at once, Dead once attempts are exhausted
    RetryImmediately,
    /// Straight to Dead
    Park,
}

/// Record counts for one (dataset, stage)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub pending: u64,
    pub claimed: u64,
    pub staged: u64,
    pub processed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl StageSummary {
    pub fn add(&mut self, state: RecordState, count: u64) {
        match state {
            RecordState::Pending => self.pending += count,
            RecordState::Claimed => self.claimed += count,
            RecordState::Staged => self.staged += count,
            RecordState::Processed => self.processed += count,
            RecordState::Failed => self.failed += count,
            RecordState::Dead => self.dead += count,
        }
    }

    pub fn get(&self, state: RecordState) -> u64 {
        match state {
            RecordState::Pending => self.pending,
            RecordState::Claimed => self.claimed,
            RecordState::Staged => self.staged,
            RecordState::Processed => self.processed,
            RecordState::Failed => self.failed,
            RecordState::Dead => self.dead,
        }
    }

    pub fn total(&self) -> u64 {
        RecordState::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

// ============================================================================
// Manifests
// ============================================================================

/// One output description inside a published manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source_uri: String,
    pub output_uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converter_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization_policy_hash: Option<String>,
}

impl ManifestEntry {
    pub fn new(source_uri: impl Into<String>, output_uris: Vec<String>) -> Self {
        Self {
            source_uri: source_uri.into(),
            output_uris,
            variant_name: None,
            width: None,
            height: None,
            annotation_format: None,
            converter_version: None,
            normalization_policy_hash: None,
        }
    }
}

/// An immutable, published record of one key's outputs for one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_id: Uuid,
    pub dataset_id: Uuid,
    pub stage: i32,
    pub source_key: String,
    pub entries: Vec<ManifestEntry>,
    pub content_hash: String,
    pub published_at: DateTime<Utc>,
}

impl Manifest {
    /// Every output URI referenced by the manifest, in entry order
    pub fn output_uris(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|e| e.output_uris.iter().cloned())
            .collect()
    }
}

/// An object known to exist in the object store with a verified checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub uri: String,
    pub size: u64,
    pub checksum: String,
}

/// Uploaded outputs waiting for their manifest to be published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputIntent {
    pub entries: Vec<ManifestEntry>,
    pub content_hash: String,
    pub objects: Vec<StoredObject>,
}

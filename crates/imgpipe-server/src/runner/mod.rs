//! The generic stage runner
//!
//! Drives every key of one (dataset, stage) through
//! Discovered -> Claimed -> Staged -> Transformed -> Published -> Done.
//! Any failure is classified (see [`StageError::classify`]) and turned into
//! exactly one store transition, so a key is always advanced, requeued or
//! parked, never dropped.
//!
//! A worker that dies between upload and publish leaves an expired claim
//! with an [`OutputIntent`]. Whoever reclaims the key first checks those
//! objects; if they are intact it publishes them as-is instead of running
//! the transform again.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use imgpipe_common::checksum::{manifest_content_hash, sha256_bytes};
use imgpipe_common::types::{
    FailureAction, ManifestEntry, OutputIntent, RecordState, StoredObject,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{Disposition, StageError};
use crate::manifest::{Claim, ManifestError, ManifestStore};
use crate::staging::{NvmeStagingCoordinator, ReconcileReport, StagingError, StagingLease};
use crate::storage::{ObjectStoreGateway, ObjectUri};

pub mod transform;
pub mod trigger;

pub use transform::{
    CommandTransform, OutputArtifact, PassthroughTransform, Transform, TransformError,
    TransformInput, TransformOutput,
};
pub use trigger::{has_allowed_extension, Trigger};

/// Where a key is in its per-stage lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPhase {
    Discovered,
    Claimed,
    Staged,
    Transformed,
    Published,
    Done,
}

impl KeyPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPhase::Discovered => "discovered",
            KeyPhase::Claimed => "claimed",
            KeyPhase::Staged => "staged",
            KeyPhase::Transformed => "transformed",
            KeyPhase::Published => "published",
            KeyPhase::Done => "done",
        }
    }
}

impl fmt::Display for KeyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one key ended for this worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyOutcome {
    /// Transformed, published and marked Processed
    Processed,
    /// Published from a previous attempt's uploaded outputs
    Adopted,
    /// Claimed elsewhere, already done, or backing off
    Skipped,
    /// Back to Pending
    Requeued,
    /// Failed with a retry scheduled
    Failed,
    /// Parked for operator review
    Dead,
}

/// Per-trigger tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: u64,
    pub adopted: u64,
    pub skipped: u64,
    pub requeued: u64,
    pub failed: u64,
    pub dead: u64,
}

impl RunSummary {
    pub fn record(&mut self, outcome: KeyOutcome) {
        match outcome {
            KeyOutcome::Processed => self.processed += 1,
            KeyOutcome::Adopted => self.adopted += 1,
            KeyOutcome::Skipped => self.skipped += 1,
            KeyOutcome::Requeued => self.requeued += 1,
            KeyOutcome::Failed => self.failed += 1,
            KeyOutcome::Dead => self.dead += 1,
        }
    }

    pub fn merge(&mut self, other: &RunSummary) {
        self.processed += other.processed;
        self.adopted += other.adopted;
        self.skipped += other.skipped;
        self.requeued += other.requeued;
        self.failed += other.failed;
        self.dead += other.dead;
    }

    pub fn total(&self) -> u64 {
        self.processed + self.adopted + self.skipped + self.requeued + self.failed + self.dead
    }
}

/// Settings for one runner instance
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub dataset_id: Uuid,
    pub stage: i32,
    /// Stage 1 reads `s3://<input_bucket>/<key>`
    pub input_bucket: String,
    pub output_bucket: String,
    pub output_prefix: String,
    pub claim_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// A transform still running after this is abandoned and retried later
    pub transform_timeout: Duration,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub allowed_extensions: Vec<String>,
    pub stage_config: serde_json::Value,
    pub page_size: usize,
}

impl RunnerConfig {
    pub fn new(dataset_id: Uuid, stage: i32, input_bucket: &str, output_bucket: &str) -> Self {
        Self {
            dataset_id,
            stage,
            input_bucket: input_bucket.to_string(),
            output_bucket: output_bucket.to_string(),
            output_prefix: String::new(),
            claim_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            transform_timeout: Duration::from_secs(3600),
            concurrency: 4,
            poll_interval: Duration::from_secs(60),
            allowed_extensions: vec![".jpg".into(), ".jpeg".into(), ".png".into()],
            stage_config: serde_json::Value::Object(Default::default()),
            page_size: crate::manifest::DEFAULT_PAGE_SIZE,
        }
    }

    fn output_uri(&self, object_name: &str) -> ObjectUri {
        ObjectUri::new(
            &self.output_bucket,
            format!("{}{}", self.output_prefix, object_name.trim_start_matches('/')),
        )
    }
}

/// A failure tagged with the phase it happened in
#[derive(Debug)]
struct PhaseFailure {
    phase: KeyPhase,
    error: StageError,
}

trait AtPhase<T> {
    fn at(self, phase: KeyPhase) -> Result<T, PhaseFailure>;
}

impl<T, E: Into<StageError>> AtPhase<T> for Result<T, E> {
    fn at(self, phase: KeyPhase) -> Result<T, PhaseFailure> {
        self.map_err(|e| PhaseFailure {
            phase,
            error: e.into(),
        })
    }
}

/// Background claim renewal for one key
///
/// Renewal stops when the heartbeat is stopped or dropped, so an abandoned
/// key future lets its claim expire.
struct Heartbeat {
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub struct StageRunner {
    config: RunnerConfig,
    store: Arc<dyn ManifestStore>,
    gateway: Arc<dyn ObjectStoreGateway>,
    staging: NvmeStagingCoordinator,
    transform: Arc<dyn Transform>,
    worker_id: String,
    cancel: CancellationToken,
}

impl StageRunner {
    pub fn new(
        config: RunnerConfig,
        store: Arc<dyn ManifestStore>,
        gateway: Arc<dyn ObjectStoreGateway>,
        staging: NvmeStagingCoordinator,
        transform: Arc<dyn Transform>,
    ) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            config,
            store,
            gateway,
            staging,
            transform,
            worker_id: format!("{host}-{}", &suffix[..8]),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Share a shutdown token; cancelling it stops new keys and heartbeats
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Clean up staging directories left behind by a previous process
    pub async fn reconcile(&self) -> Result<ReconcileReport, StagingError> {
        self.staging.reconcile(self.store.as_ref()).await
    }

    /// Discover candidate keys for a trigger and process them with bounded
    /// parallelism
    pub async fn run_trigger(&self, trigger: &Trigger) -> Result<RunSummary, StageError> {
        let span = info_span!(
            "run_trigger",
            dataset_id = %self.config.dataset_id,
            stage = self.config.stage,
            worker_id = %self.worker_id,
        );

        async {
            let keys = self.discover(trigger).await?;
            let mut summary = RunSummary::default();
            let mut discovery_error: Option<ManifestError> = None;

            {
                // A failed page ends discovery; keys already started still finish
                let outcomes = keys
                    .take_until(self.cancel.clone().cancelled_owned())
                    .scan(&mut discovery_error, |slot, item| {
                        futures::future::ready(match item {
                            Ok(key) => Some(key),
                            Err(e) => {
                                **slot = Some(e);
                                None
                            }
                        })
                    })
                    .map(|key| async move { self.process_key(&key).await })
                    .buffer_unordered(self.config.concurrency.max(1));
                let mut outcomes = std::pin::pin!(outcomes);

                while let Some(outcome) = outcomes.next().await {
                    summary.record(outcome);
                }
            }

            if let Some(e) = discovery_error {
                error!(
                    error = %e,
                    finished = summary.total(),
                    "Discovery failed, in-flight keys drained"
                );
                return Err(e.into());
            }

            info!(
                processed = summary.processed,
                adopted = summary.adopted,
                skipped = summary.skipped,
                requeued = summary.requeued,
                failed = summary.failed,
                dead = summary.dead,
                "Trigger finished"
            );
            Ok::<_, StageError>(summary)
        }
        .instrument(span)
        .await
    }

    /// Re-run discovery every `poll_interval` until cancelled
    pub async fn run_polling(&self, prefix: &str) -> Result<RunSummary, StageError> {
        let mut total = RunSummary::default();
        let trigger = Trigger::poll(prefix);

        while !self.cancel.is_cancelled() {
            // Orphans retained on an earlier pass are freed once their claims expire
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "Staging reconcile failed");
            }

            match self.run_trigger(&trigger).await {
                Ok(summary) => total.merge(&summary),
                // The next poll retries; only the store being unreachable lands here
                Err(e) => error!(error = %e, "Poll cycle failed"),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(total = total.total(), "Polling stopped");
        Ok(total)
    }

    /// Candidate keys for a trigger, as a lazy stream of unprocessed keys
    async fn discover<'a>(
        &'a self,
        trigger: &'a Trigger,
    ) -> Result<BoxStream<'a, Result<String, ManifestError>>, StageError> {
        let dataset_id = self.config.dataset_id;
        let stage = self.config.stage;

        if stage == 1 {
            let found: Vec<String> = match trigger {
                Trigger::Event { key } => vec![key.clone()],
                Trigger::Poll { prefix } => {
                    self.gateway
                        .list(&ObjectUri::new(&self.config.input_bucket, prefix.as_str()))
                        .await?
                }
            };
            let accepted: Vec<String> = found
                .into_iter()
                .filter(|k| has_allowed_extension(k, &self.config.allowed_extensions))
                .collect();
            let created = self
                .store
                .register_pending(dataset_id, stage, &accepted)
                .await?;
            debug!(listed = accepted.len(), created, "Registered discovered keys");
        }

        let keys = self.store.query_unprocessed(
            dataset_id,
            stage,
            trigger.prefix(),
            None,
            self.config.page_size,
        );

        Ok(match trigger {
            // A single-key lookup: the prefix query may match longer keys too
            Trigger::Event { key } => keys
                .try_filter(move |k| futures::future::ready(k == key))
                .boxed(),
            Trigger::Poll { .. } => keys,
        })
    }

    /// Run one key through the full state machine
    pub async fn process_key(&self, key: &str) -> KeyOutcome {
        let span = info_span!("process_key", stage = self.config.stage, key = %key);
        self.process_key_inner(key).instrument(span).await
    }

    async fn process_key_inner(&self, key: &str) -> KeyOutcome {
        let claim = match self
            .store
            .claim_for_processing(
                self.config.dataset_id,
                self.config.stage,
                key,
                self.config.claim_ttl,
                &self.worker_id,
            )
            .await
        {
            Ok(claim) => claim,
            Err(ManifestError::AlreadyClaimed { holder, .. }) => {
                debug!(?holder, "Key already claimed, skipping");
                return KeyOutcome::Skipped;
            }
            Err(e @ (ManifestError::NotClaimable { .. } | ManifestError::BackingOff { .. })) => {
                debug!(reason = %e, "Key not claimable, skipping");
                return KeyOutcome::Skipped;
            }
            Err(e) => {
                // Nothing is held; the key stays discoverable for the next trigger
                warn!(error = %e, "Claim failed");
                return KeyOutcome::Skipped;
            }
        };

        debug!(token = %claim.token, attempt = claim.record.attempt_count, "Claimed key");
        let heartbeat = self.spawn_heartbeat(claim.token);
        let result = self.drive(key, &claim, &heartbeat).await;
        let lost = heartbeat.is_lost();
        heartbeat.stop().await;

        match result {
            Ok(outcome) => outcome,
            Err(failure) => self.settle(key, &claim, failure, lost).await,
        }
    }

    async fn drive(
        &self,
        key: &str,
        claim: &Claim,
        heartbeat: &Heartbeat,
    ) -> Result<KeyOutcome, PhaseFailure> {
        let dataset_id = self.config.dataset_id;
        let stage = self.config.stage;

        // A previous attempt may have published but died before marking
        if self
            .store
            .get_manifest(dataset_id, stage, key)
            .await
            .at(KeyPhase::Claimed)?
            .is_some()
        {
            self.store
                .mark_processed(claim.token)
                .await
                .at(KeyPhase::Published)?;
            info!("Manifest already published, marked processed");
            return Ok(KeyOutcome::Adopted);
        }

        if let Some(intent) = &claim.record.output_intent {
            if self.outputs_intact(intent).await.at(KeyPhase::Transformed)? {
                self.publish(key, claim, &intent.entries, &intent.content_hash)
                    .await?;
                info!(outputs = intent.objects.len(), "Adopted outputs of a previous attempt");
                return Ok(KeyOutcome::Adopted);
            }
            info!("Previous outputs missing or corrupt, redoing the key");
        }

        let input_uris = self.input_uris(key).await.at(KeyPhase::Claimed)?;

        let mut estimated: u64 = 0;
        for uri in &input_uris {
            estimated += self.gateway.stat(uri).await.at(KeyPhase::Claimed)?.size;
        }
        let headroom = self.staging.config().output_headroom.max(1.0);
        let reserve = ((estimated.max(1) as f64) * headroom).ceil() as u64;

        let mut lease = self
            .staging
            .acquire_input_space(dataset_id, stage, key, reserve)
            .await
            .at(KeyPhase::Claimed)?;

        for uri in &input_uris {
            self.staging
                .copy_in(&mut lease, uri)
                .await
                .at(KeyPhase::Claimed)?;
        }
        self.store
            .mark_staged(claim.token)
            .await
            .at(KeyPhase::Staged)?;

        let run = self.transform.run(TransformInput {
            dataset_id,
            stage,
            key: key.to_string(),
            input_uris: input_uris.iter().map(ToString::to_string).collect(),
            input_paths: lease.staged_files().iter().map(|f| f.path.clone()).collect(),
            output_dir: lease.output_dir(),
            stage_config: self.config.stage_config.clone(),
        });
        let output = match tokio::time::timeout(self.config.transform_timeout, run).await {
            Ok(result) => result.at(KeyPhase::Staged)?,
            Err(_) => {
                return Err(PhaseFailure {
                    phase: KeyPhase::Staged,
                    error: TransformError::Retryable(format!(
                        "{} did not finish within {:?}",
                        self.transform.name(),
                        self.config.transform_timeout
                    ))
                    .into(),
                })
            }
        };

        if output.outputs.is_empty() {
            return Err(PhaseFailure {
                phase: KeyPhase::Transformed,
                error: TransformError::Fatal("transform produced no outputs".into()).into(),
            });
        }

        // Uploading after losing the claim could race the new owner
        self.confirm_claim(claim, heartbeat)
            .await
            .at(KeyPhase::Transformed)?;

        let (entries, objects) = self
            .upload_outputs(&lease, &input_uris, &output)
            .await
            .at(KeyPhase::Transformed)?;
        let content_hash = manifest_content_hash(&entries)
            .map_err(ManifestError::from)
            .at(KeyPhase::Transformed)?;

        let intent = OutputIntent {
            entries,
            content_hash,
            objects,
        };
        self.store
            .record_output_intent(claim.token, &intent)
            .await
            .at(KeyPhase::Transformed)?;

        self.confirm_claim(claim, heartbeat)
            .await
            .at(KeyPhase::Transformed)?;
        self.publish(key, claim, &intent.entries, &intent.content_hash)
            .await?;

        if let Err(e) = self.staging.release(lease).await {
            warn!(error = %e, "Lease directory cleanup failed");
        }

        info!(outputs = intent.objects.len(), "Key processed");
        Ok(KeyOutcome::Processed)
    }

    /// Publish and mark processed
    async fn publish(
        &self,
        key: &str,
        claim: &Claim,
        entries: &[ManifestEntry],
        content_hash: &str,
    ) -> Result<(), PhaseFailure> {
        let manifest = self
            .store
            .publish_manifest(
                self.config.dataset_id,
                self.config.stage,
                key,
                entries,
                content_hash,
            )
            .await
            .at(KeyPhase::Transformed)?;
        debug!(manifest_id = %manifest.manifest_id, "Manifest published");

        self.store
            .mark_processed(claim.token)
            .await
            .at(KeyPhase::Published)?;
        Ok(())
    }

    /// Check ownership with a synchronous renewal
    async fn confirm_claim(&self, claim: &Claim, heartbeat: &Heartbeat) -> Result<(), StageError> {
        if heartbeat.is_lost() {
            return Err(StageError::ClaimLost);
        }
        match self.store.heartbeat(claim.token, self.config.claim_ttl).await {
            Ok(_) => Ok(()),
            Err(ManifestError::ClaimLost(_)) => Err(StageError::ClaimLost),
            Err(e) => Err(e.into()),
        }
    }

    /// Stage 1 reads the raw object; later stages read the previous
    /// stage's published outputs
    async fn input_uris(&self, key: &str) -> Result<Vec<ObjectUri>, StageError> {
        if self.config.stage == 1 {
            return Ok(vec![ObjectUri::new(&self.config.input_bucket, key)]);
        }

        let previous = self.config.stage - 1;
        let manifest = self
            .store
            .get_manifest(self.config.dataset_id, previous, key)
            .await?
            .ok_or_else(|| ManifestError::NotPublished {
                key: key.to_string(),
                stage: previous,
            })?;

        manifest
            .output_uris()
            .iter()
            .map(|u| u.parse::<ObjectUri>().map_err(StageError::from))
            .collect()
    }

    async fn upload_outputs(
        &self,
        lease: &StagingLease,
        input_uris: &[ObjectUri],
        output: &TransformOutput,
    ) -> Result<(Vec<ManifestEntry>, Vec<StoredObject>), StageError> {
        let mut entries = Vec::with_capacity(output.outputs.len());
        let mut objects = Vec::with_capacity(output.outputs.len());
        let output_dir = lease.output_dir();

        for artifact in &output.outputs {
            let source = input_uris.get(artifact.source_index).ok_or_else(|| {
                TransformError::Fatal(format!(
                    "output {} names input {} of {}",
                    artifact.object_name,
                    artifact.source_index,
                    input_uris.len()
                ))
            })?;

            let remote = self.config.output_uri(&artifact.object_name);
            let stored = self
                .staging
                .copy_out(lease, &artifact.resolve(&output_dir), &remote)
                .await?;

            entries.push(ManifestEntry {
                source_uri: source.to_string(),
                output_uris: vec![stored.uri.clone()],
                variant_name: artifact.variant_name.clone(),
                width: artifact.width,
                height: artifact.height,
                annotation_format: artifact.annotation_format.clone(),
                converter_version: artifact.converter_version.clone(),
                normalization_policy_hash: artifact.normalization_policy_hash.clone(),
            });
            objects.push(stored);
        }

        Ok((entries, objects))
    }

    /// True when every recorded object exists and still hashes to the
    /// recorded checksum
    async fn outputs_intact(&self, intent: &OutputIntent) -> Result<bool, StageError> {
        if intent.objects.is_empty() {
            return Ok(false);
        }

        for object in &intent.objects {
            let uri: ObjectUri = object.uri.parse()?;
            let Some(stat) = self.gateway.try_stat(&uri).await? else {
                debug!(uri = %uri, "Recorded output is missing");
                return Ok(false);
            };
            if stat.size != object.size {
                debug!(uri = %uri, expected = object.size, actual = stat.size, "Recorded output has wrong size");
                return Ok(false);
            }
            // Stored checksum metadata would not catch bit rot
            let checksum = sha256_bytes(&self.gateway.get(&uri).await?);
            if !checksum.eq_ignore_ascii_case(&object.checksum) {
                debug!(uri = %uri, "Recorded output has wrong checksum");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Turn a failure into exactly one store transition
    async fn settle(
        &self,
        key: &str,
        claim: &Claim,
        failure: PhaseFailure,
        heartbeat_lost: bool,
    ) -> KeyOutcome {
        let PhaseFailure { phase, error } = failure;

        // Another worker took over; whatever it published wins
        let disposition = if error.is_claim_lost() || (heartbeat_lost && error.is_conflict()) {
            Disposition::Skip
        } else {
            error.classify()
        };
        let message = format!("{phase}: {error}");

        let result = match disposition {
            Disposition::Skip => {
                info!(%phase, error = %error, "Claim lost, leaving key to its new owner");
                return KeyOutcome::Skipped;
            }
            Disposition::Requeue => self.store.requeue(claim.token, &message).await,
            Disposition::RetryImmediately => {
                self.store
                    .fail(claim.token, &message, FailureAction::RetryImmediately)
                    .await
            }
            Disposition::RetryWithBackoff => {
                self.store
                    .fail(claim.token, &message, FailureAction::RetryWithBackoff)
                    .await
            }
            Disposition::Park => {
                self.store
                    .fail(claim.token, &message, FailureAction::Park)
                    .await
            }
        };

        match result {
            Ok(record) => {
                let outcome = match record.state {
                    RecordState::Pending => KeyOutcome::Requeued,
                    RecordState::Dead => KeyOutcome::Dead,
                    _ => KeyOutcome::Failed,
                };
                match outcome {
                    KeyOutcome::Dead => error!(
                        %phase,
                        attempts = record.attempt_count,
                        error = %error,
                        "Key parked dead"
                    ),
                    _ => warn!(
                        %phase,
                        ?disposition,
                        attempts = record.attempt_count,
                        error = %error,
                        "Key attempt failed"
                    ),
                }
                outcome
            }
            Err(ManifestError::ClaimLost(_)) => KeyOutcome::Skipped,
            Err(e) => {
                // The claim expires on its own and the attempt counts
                error!(key, error = %e, original = %message, "Could not record failure");
                KeyOutcome::Failed
            }
        }
    }

    fn spawn_heartbeat(&self, token: Uuid) -> Heartbeat {
        let lost = Arc::new(AtomicBool::new(false));
        let stop = self.cancel.child_token();
        let store = Arc::clone(&self.store);
        let ttl = self.config.claim_ttl;
        let period = self.config.heartbeat_interval;

        let handle = {
            let lost = Arc::clone(&lost);
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            match store.heartbeat(token, ttl).await {
                                Ok(expiry) => debug!(%token, %expiry, "Claim renewed"),
                                Err(ManifestError::ClaimLost(_)) => {
                                    warn!(%token, "Claim lost during heartbeat");
                                    lost.store(true, Ordering::Release);
                                    break;
                                }
                                Err(e) => warn!(%token, error = %e, "Heartbeat failed, will retry"),
                            }
                        }
                    }
                }
            })
        };

        Heartbeat {
            lost,
            stop,
            handle: Some(handle),
        }
    }
}

/// Process a fixed list of keys (the `--keys` CLI path)
pub async fn process_keys(runner: &StageRunner, keys: &[String]) -> RunSummary {
    let mut summary = RunSummary::default();
    let mut outcomes = stream::iter(keys)
        .map(|key| runner.process_key(key))
        .buffer_unordered(runner.config.concurrency.max(1));
    while let Some(outcome) = outcomes.next().await {
        summary.record(outcome);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = RunSummary::default();
        summary.record(KeyOutcome::Processed);
        summary.record(KeyOutcome::Skipped);
        summary.record(KeyOutcome::Skipped);

        let mut other = RunSummary::default();
        other.record(KeyOutcome::Dead);
        summary.merge(&other);

        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.dead, 1);
        assert_eq!(summary.total(), 4);
    }

    #[test]
    fn test_output_uri_joins_prefix() {
        let mut config = RunnerConfig::new(Uuid::new_v4(), 1, "raw", "augmented");
        config.output_prefix = "drone-batch-1/".into();
        assert_eq!(
            config.output_uri("a.jpg").to_string(),
            "s3://augmented/drone-batch-1/a.jpg"
        );
        assert_eq!(config.output_uri("/b.jpg").key, "drone-batch-1/b.jpg");
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(KeyPhase::Transformed.to_string(), "transformed");
    }
}

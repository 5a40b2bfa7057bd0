//! In-process [`ManifestStore`] with an injectable clock
//!
//! Follows the same transition rules as the PostgreSQL store. A single
//! mutex serializes every operation, which gives the same atomicity the
//! conditional SQL statements give across processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgpipe_common::types::{
    Dataset, FailureAction, Manifest, ManifestEntry, OutputIntent, RecordState, StageRecord,
    StageSummary,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use super::{
    check_stage, failure_transition, to_chrono, verify_content_hash, Claim, ManifestError,
    ManifestResult, ManifestStore, RetryPolicy,
};

/// Source of "now" for claim expiry and backoff decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += to_chrono(by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type RecordKey = (Uuid, i32, String);

#[derive(Debug, Default)]
struct Inner {
    datasets: BTreeMap<String, Dataset>,
    records: BTreeMap<RecordKey, StageRecord>,
    manifests: BTreeMap<RecordKey, Manifest>,
}

impl Inner {
    fn by_token(&mut self, token: Uuid) -> ManifestResult<&mut StageRecord> {
        self.records
            .values_mut()
            .find(|r| r.claim_token == Some(token) && r.state.holds_claim())
            .ok_or(ManifestError::ClaimLost(token))
    }
}

/// Manifest store held entirely in memory
pub struct InMemoryManifestStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl InMemoryManifestStore {
    pub fn new(retry: RetryPolicy) -> Self {
        Self::with_clock(retry, Arc::new(SystemClock))
    }

    pub fn with_clock(retry: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            retry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of published manifests across all datasets
    pub fn manifest_count(&self) -> usize {
        self.lock().manifests.len()
    }

    fn new_record(dataset_id: Uuid, stage: i32, key: &str, now: DateTime<Utc>) -> StageRecord {
        StageRecord {
            id: Uuid::new_v4(),
            dataset_id,
            stage,
            object_key: key.to_string(),
            state: RecordState::Pending,
            claim_token: None,
            claim_expiry: None,
            worker_id: None,
            attempt_count: 0,
            last_error: None,
            not_before: None,
            output_intent: None,
            first_seen_at: now,
            updated_at: now,
            processed_at: None,
        }
    }
}

fn release_claim(record: &mut StageRecord, state: RecordState, now: DateTime<Utc>) {
    record.state = state;
    record.claim_token = None;
    record.claim_expiry = None;
    record.updated_at = now;
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    async fn now(&self) -> ManifestResult<DateTime<Utc>> {
        Ok(self.clock.now())
    }

    async fn register_dataset(&self, name: &str) -> ManifestResult<Dataset> {
        if name.trim().is_empty() {
            return Err(ManifestError::InvalidInput("dataset name is empty".into()));
        }
        let now = self.clock.now();
        let mut inner = self.lock();
        let dataset = inner
            .datasets
            .entry(name.to_string())
            .or_insert_with(|| Dataset {
                id: Uuid::new_v4(),
                name: name.to_string(),
                created_at: now,
            });
        Ok(dataset.clone())
    }

    async fn get_dataset_by_name(&self, name: &str) -> ManifestResult<Option<Dataset>> {
        Ok(self.lock().datasets.get(name).cloned())
    }

    async fn list_datasets(&self) -> ManifestResult<Vec<Dataset>> {
        Ok(self.lock().datasets.values().cloned().collect())
    }

    async fn register_pending(
        &self,
        dataset_id: Uuid,
        stage: i32,
        keys: &[String],
    ) -> ManifestResult<u64> {
        check_stage(stage)?;
        let now = self.clock.now();
        let mut inner = self.lock();
        let mut created = 0;
        for key in keys {
            let slot = (dataset_id, stage, key.clone());
            if !inner.records.contains_key(&slot) {
                inner
                    .records
                    .insert(slot, Self::new_record(dataset_id, stage, key, now));
                created += 1;
            }
        }
        Ok(created)
    }

    async fn claim_for_processing(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
        ttl: Duration,
        worker_id: &str,
    ) -> ManifestResult<Claim> {
        check_stage(stage)?;
        let now = self.clock.now();
        let max_attempts = self.retry.max_attempts;
        let mut inner = self.lock();
        let record = inner
            .records
            .entry((dataset_id, stage, key.to_string()))
            .or_insert_with(|| Self::new_record(dataset_id, stage, key, now));

        if !record.is_claimable(now) {
            return Err(match record.state {
                RecordState::Failed => ManifestError::BackingOff {
                    key: key.to_string(),
                    not_before: record.not_before.unwrap_or(now),
                },
                RecordState::Processed | RecordState::Dead => ManifestError::NotClaimable {
                    key: key.to_string(),
                    state: record.state,
                },
                _ => ManifestError::AlreadyClaimed {
                    key: key.to_string(),
                    holder: record.worker_id.clone(),
                    expires_at: record.claim_expiry,
                },
            });
        }

        if record.state.holds_claim() && record.attempt_count >= max_attempts {
            record.last_error = Some(format!(
                "claim expired after {} attempts",
                record.attempt_count
            ));
            release_claim(record, RecordState::Dead, now);
            return Err(ManifestError::NotClaimable {
                key: key.to_string(),
                state: RecordState::Dead,
            });
        }

        let token = Uuid::new_v4();
        let expires_at = now + to_chrono(ttl);
        record.state = RecordState::Claimed;
        record.claim_token = Some(token);
        record.claim_expiry = Some(expires_at);
        record.worker_id = Some(worker_id.to_string());
        record.attempt_count += 1;
        record.not_before = None;
        record.updated_at = now;

        Ok(Claim {
            token,
            expires_at,
            record: record.clone(),
        })
    }

    async fn heartbeat(&self, token: Uuid, ttl: Duration) -> ManifestResult<DateTime<Utc>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let record = inner.by_token(token)?;
        let expiry = now + to_chrono(ttl);
        record.claim_expiry = Some(expiry);
        record.updated_at = now;
        Ok(expiry)
    }

    async fn mark_staged(&self, token: Uuid) -> ManifestResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let record = inner.by_token(token)?;
        record.state = RecordState::Staged;
        record.updated_at = now;
        Ok(())
    }

    async fn record_output_intent(
        &self,
        token: Uuid,
        intent: &OutputIntent,
    ) -> ManifestResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let record = inner.by_token(token)?;
        record.output_intent = Some(intent.clone());
        record.updated_at = now;
        Ok(())
    }

    async fn publish_manifest(
        &self,
        dataset_id: Uuid,
        stage: i32,
        source_key: &str,
        entries: &[ManifestEntry],
        content_hash: &str,
    ) -> ManifestResult<Manifest> {
        check_stage(stage)?;
        let content_hash = verify_content_hash(entries, content_hash)?;
        let now = self.clock.now();
        let mut inner = self.lock();

        if !inner.datasets.values().any(|d| d.id == dataset_id) {
            return Err(ManifestError::DatasetNotFound(dataset_id.to_string()));
        }

        let slot = (dataset_id, stage, source_key.to_string());
        if let Some(existing) = inner.manifests.get(&slot) {
            if existing.content_hash != content_hash {
                return Err(ManifestError::Conflict {
                    key: source_key.to_string(),
                    existing_hash: existing.content_hash.clone(),
                    attempted_hash: content_hash,
                });
            }
            return Ok(existing.clone());
        }

        let manifest = Manifest {
            manifest_id: Uuid::new_v4(),
            dataset_id,
            stage,
            source_key: source_key.to_string(),
            entries: entries.to_vec(),
            content_hash,
            published_at: now,
        };
        inner.manifests.insert(slot, manifest.clone());
        Ok(manifest)
    }

    async fn mark_processed(&self, token: Uuid) -> ManifestResult<StageRecord> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let slot = {
            let record = inner.by_token(token)?;
            (record.dataset_id, record.stage, record.object_key.clone())
        };
        if !inner.manifests.contains_key(&slot) {
            return Err(ManifestError::NotPublished {
                key: slot.2,
                stage: slot.1,
            });
        }

        let record = inner.by_token(token)?;
        release_claim(record, RecordState::Processed, now);
        record.not_before = None;
        record.processed_at = Some(now);
        Ok(record.clone())
    }

    async fn fail(
        &self,
        token: Uuid,
        error: &str,
        action: FailureAction,
    ) -> ManifestResult<StageRecord> {
        let now = self.clock.now();
        let retry = self.retry;
        let mut inner = self.lock();
        let record = inner.by_token(token)?;
        let (state, not_before) = failure_transition(&retry, record.attempt_count, action, now);
        release_claim(record, state, now);
        record.not_before = not_before;
        record.last_error = Some(error.to_string());
        Ok(record.clone())
    }

    async fn requeue(&self, token: Uuid, reason: &str) -> ManifestResult<StageRecord> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let record = inner.by_token(token)?;
        release_claim(record, RecordState::Pending, now);
        record.attempt_count = (record.attempt_count - 1).max(0);
        record.last_error = Some(reason.to_string());
        Ok(record.clone())
    }

    async fn get_record(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
    ) -> ManifestResult<Option<StageRecord>> {
        Ok(self
            .lock()
            .records
            .get(&(dataset_id, stage, key.to_string()))
            .cloned())
    }

    async fn get_manifest(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
    ) -> ManifestResult<Option<Manifest>> {
        Ok(self
            .lock()
            .manifests
            .get(&(dataset_id, stage, key.to_string()))
            .cloned())
    }

    async fn unprocessed_page(
        &self,
        dataset_id: Uuid,
        stage: i32,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> ManifestResult<Vec<String>> {
        check_stage(stage)?;
        let inner = self.lock();
        let universe_stage = if stage == 1 { 1 } else { stage - 1 };

        let keys = inner
            .records
            .values()
            .filter(|r| r.dataset_id == dataset_id && r.stage == universe_stage)
            .filter(|r| r.object_key.starts_with(prefix))
            .filter(|r| start_after.is_none_or(|after| r.object_key.as_str() > after))
            .filter(|r| {
                if stage == 1 {
                    !r.state.is_terminal()
                } else {
                    r.state == RecordState::Processed
                        && inner
                            .records
                            .get(&(dataset_id, stage, r.object_key.clone()))
                            .is_none_or(|cur| !cur.state.is_terminal())
                }
            })
            .map(|r| r.object_key.clone())
            .take(limit)
            .collect();

        Ok(keys)
    }

    async fn get_manifest_chain(&self, dataset_id: Uuid) -> ManifestResult<Vec<Manifest>> {
        let mut chain: Vec<Manifest> = self
            .lock()
            .manifests
            .values()
            .filter(|m| m.dataset_id == dataset_id)
            .cloned()
            .collect();
        chain.sort_by(|a, b| (a.stage, &a.source_key).cmp(&(b.stage, &b.source_key)));
        Ok(chain)
    }

    async fn get_key_lineage(&self, dataset_id: Uuid, key: &str) -> ManifestResult<Vec<Manifest>> {
        let mut lineage: Vec<Manifest> = self
            .lock()
            .manifests
            .values()
            .filter(|m| m.dataset_id == dataset_id && m.source_key == key)
            .cloned()
            .collect();
        lineage.sort_by_key(|m| m.stage);
        Ok(lineage)
    }

    async fn list_dead(
        &self,
        dataset_id: Uuid,
        stage: Option<i32>,
    ) -> ManifestResult<Vec<StageRecord>> {
        let mut dead: Vec<StageRecord> = self
            .lock()
            .records
            .values()
            .filter(|r| r.dataset_id == dataset_id && r.state == RecordState::Dead)
            .filter(|r| stage.is_none_or(|s| r.stage == s))
            .cloned()
            .collect();
        dead.sort_by(|a, b| (a.stage, &a.object_key).cmp(&(b.stage, &b.object_key)));
        Ok(dead)
    }

    async fn revive(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
    ) -> ManifestResult<StageRecord> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(&(dataset_id, stage, key.to_string()))
            .ok_or_else(|| ManifestError::RecordNotFound {
                key: key.to_string(),
                stage,
            })?;

        if record.state != RecordState::Dead {
            return Err(ManifestError::InvalidInput(format!(
                "'{key}' is {}, only dead records can be revived",
                record.state
            )));
        }

        record.state = RecordState::Pending;
        record.attempt_count = 0;
        record.not_before = None;
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn stage_summary(&self, dataset_id: Uuid, stage: i32) -> ManifestResult<StageSummary> {
        let mut summary = StageSummary::default();
        for record in self
            .lock()
            .records
            .values()
            .filter(|r| r.dataset_id == dataset_id && r.stage == stage)
        {
            summary.add(record.state, 1);
        }
        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use imgpipe_common::checksum::manifest_content_hash;

    const TTL: Duration = Duration::from_secs(30);

    fn store() -> (InMemoryManifestStore, ManualClock) {
        let clock = ManualClock::default();
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
        };
        (
            InMemoryManifestStore::with_clock(policy, Arc::new(clock.clone())),
            clock,
        )
    }

    fn entries(key: &str) -> (Vec<ManifestEntry>, String) {
        let entries = vec![ManifestEntry::new(
            format!("s3://raw/{key}"),
            vec![format!("s3://aug/{key}")],
        )];
        let hash = manifest_content_hash(&entries).unwrap();
        (entries, hash)
    }

    #[tokio::test]
    async fn test_register_dataset_is_idempotent() {
        let (store, _) = store();
        let a = store.register_dataset("drone-batch-1").await.unwrap();
        let b = store.register_dataset("drone-batch-1").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list_datasets().await.unwrap().len(), 1);
        assert!(store.register_dataset("  ").await.is_err());
    }

    #[tokio::test]
    async fn test_only_one_live_claim() {
        let (store, clock) = store();
        let ds = store.register_dataset("ds").await.unwrap();

        let first = store
            .claim_for_processing(ds.id, 1, "a.jpg", TTL, "w1")
            .await
            .unwrap();
        let second = store.claim_for_processing(ds.id, 1, "a.jpg", TTL, "w2").await;
        assert!(matches!(second, Err(ManifestError::AlreadyClaimed { .. })));

        clock.advance(Duration::from_secs(31));
        let third = store
            .claim_for_processing(ds.id, 1, "a.jpg", TTL, "w2")
            .await
            .unwrap();
        assert_ne!(first.token, third.token);
        assert_eq!(third.record.attempt_count, 2);

        // The first worker's token is dead now
        assert!(matches!(
            store.heartbeat(first.token, TTL).await,
            Err(ManifestError::ClaimLost(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_is_idempotent_and_detects_conflicts() {
        let (store, _) = store();
        let ds = store.register_dataset("ds").await.unwrap();
        let (e, hash) = entries("a.jpg");

        let m1 = store.publish_manifest(ds.id, 1, "a.jpg", &e, &hash).await.unwrap();
        let m2 = store.publish_manifest(ds.id, 1, "a.jpg", &e, &hash).await.unwrap();
        assert_eq!(m1.manifest_id, m2.manifest_id);
        assert_eq!(store.manifest_count(), 1);

        let (other, other_hash) = entries("other.jpg");
        assert!(matches!(
            store.publish_manifest(ds.id, 1, "a.jpg", &other, &other_hash).await,
            Err(ManifestError::Conflict { .. })
        ));
        assert!(matches!(
            store.publish_manifest(ds.id, 1, "b.jpg", &e, "bogus").await,
            Err(ManifestError::HashMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_mark_processed_requires_manifest() {
        let (store, _) = store();
        let ds = store.register_dataset("ds").await.unwrap();
        let claim = store
            .claim_for_processing(ds.id, 1, "a.jpg", TTL, "w1")
            .await
            .unwrap();

        assert!(matches!(
            store.mark_processed(claim.token).await,
            Err(ManifestError::NotPublished { .. })
        ));

        let (e, hash) = entries("a.jpg");
        store.publish_manifest(ds.id, 1, "a.jpg", &e, &hash).await.unwrap();
        let record = store.mark_processed(claim.token).await.unwrap();
        assert_eq!(record.state, RecordState::Processed);
        assert!(record.claim_token.is_none());

        assert!(matches!(
            store.claim_for_processing(ds.id, 1, "a.jpg", TTL, "w2").await,
            Err(ManifestError::NotClaimable { .. })
        ));
    }

    #[tokio::test]
    async fn test_backoff_then_dead() {
        let (store, clock) = store();
        let ds = store.register_dataset("ds").await.unwrap();

        for attempt in 1..=3 {
            let claim = store
                .claim_for_processing(ds.id, 1, "a.jpg", TTL, "w1")
                .await
                .unwrap();
            assert_eq!(claim.record.attempt_count, attempt);
            let record = store
                .fail(claim.token, "transform: timeout", FailureAction::RetryWithBackoff)
                .await
                .unwrap();

            if attempt < 3 {
                assert_eq!(record.state, RecordState::Failed);
                assert!(matches!(
                    store.claim_for_processing(ds.id, 1, "a.jpg", TTL, "w1").await,
                    Err(ManifestError::BackingOff { .. })
                ));
                clock.advance(Duration::from_secs(60));
            } else {
                assert_eq!(record.state, RecordState::Dead);
                assert_eq!(record.last_error.as_deref(), Some("transform: timeout"));
            }
        }

        let dead = store.list_dead(ds.id, Some(1)).await.unwrap();
        assert_eq!(dead.len(), 1);

        let revived = store.revive(ds.id, 1, "a.jpg").await.unwrap();
        assert_eq!(revived.state, RecordState::Pending);
        assert_eq!(revived.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_requeue_refunds_attempt() {
        let (store, _) = store();
        let ds = store.register_dataset("ds").await.unwrap();
        let claim = store
            .claim_for_processing(ds.id, 1, "a.jpg", TTL, "w1")
            .await
            .unwrap();
        let record = store.requeue(claim.token, "capacity").await.unwrap();
        assert_eq!(record.state, RecordState::Pending);
        assert_eq!(record.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_expired_claim_with_no_attempts_left_is_parked() {
        let (store, clock) = store();
        let ds = store.register_dataset("ds").await.unwrap();

        for _ in 0..3 {
            store
                .claim_for_processing(ds.id, 1, "a.jpg", TTL, "w1")
                .await
                .unwrap();
            clock.advance(Duration::from_secs(31));
        }

        assert!(matches!(
            store.claim_for_processing(ds.id, 1, "a.jpg", TTL, "w1").await,
            Err(ManifestError::NotClaimable {
                state: RecordState::Dead,
                ..
            })
        ));
        let record = store.get_record(ds.id, 1, "a.jpg").await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Dead);
        assert!(record.last_error.unwrap().contains("3 attempts"));
    }

    #[tokio::test]
    async fn test_query_unprocessed_pages_and_restarts() {
        let (store, _) = store();
        let ds = store.register_dataset("ds").await.unwrap();
        let keys: Vec<String> = (0..7).map(|i| format!("img/{i:02}.jpg")).collect();
        store.register_pending(ds.id, 1, &keys).await.unwrap();
        store
            .register_pending(ds.id, 1, &["other/x.jpg".to_string()])
            .await
            .unwrap();

        let all: Vec<String> = store
            .query_unprocessed(ds.id, 1, "img/", None, 3)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all, keys);

        let rest: Vec<String> = store
            .query_unprocessed(ds.id, 1, "img/", Some("img/04.jpg".into()), 3)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rest, keys[5..].to_vec());
    }

    #[tokio::test]
    async fn test_stage_two_waits_for_stage_one() {
        let (store, _) = store();
        let ds = store.register_dataset("ds").await.unwrap();
        store
            .register_pending(ds.id, 1, &["a.jpg".to_string(), "b.jpg".to_string()])
            .await
            .unwrap();

        let stage2: Vec<String> = store
            .query_unprocessed(ds.id, 2, "", None, 10)
            .try_collect()
            .await
            .unwrap();
        assert!(stage2.is_empty());

        let claim = store
            .claim_for_processing(ds.id, 1, "a.jpg", TTL, "w1")
            .await
            .unwrap();
        let (e, hash) = entries("a.jpg");
        store.publish_manifest(ds.id, 1, "a.jpg", &e, &hash).await.unwrap();
        store.mark_processed(claim.token).await.unwrap();

        let stage2: Vec<String> = store
            .query_unprocessed(ds.id, 2, "", None, 10)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(stage2, vec!["a.jpg".to_string()]);

        let summary = store.stage_summary(ds.id, 1).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.pending, 1);
    }
}

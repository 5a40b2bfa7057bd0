//! PostgreSQL-backed [`ManifestStore`]
//!
//! Claim and publish are single conditional statements; PostgreSQL's row
//! locking under READ COMMITTED re-checks the `WHERE` clause against the
//! latest row version, which makes them compare-and-swap operations across
//! every worker sharing the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgpipe_common::types::{
    Dataset, FailureAction, Manifest, ManifestEntry, OutputIntent, RecordState, StageRecord,
    StageSummary,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    check_stage, failure_transition, verify_content_hash, Claim, ManifestError, ManifestResult,
    ManifestStore, RetryPolicy,
};
use crate::config::DatabaseConfig;

const RECORD_COLUMNS: &str = "id, dataset_id, stage, object_key, state, claim_token, \
     claim_expiry, worker_id, attempt_count, last_error, not_before, output_intent, \
     first_seen_at, updated_at, processed_at";

const MANIFEST_COLUMNS: &str =
    "manifest_id, dataset_id, stage, source_key, content_hash, published_at";

#[derive(Debug, FromRow)]
struct StageRecordRow {
    id: Uuid,
    dataset_id: Uuid,
    stage: i32,
    object_key: String,
    state: String,
    claim_token: Option<Uuid>,
    claim_expiry: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    attempt_count: i32,
    last_error: Option<String>,
    not_before: Option<DateTime<Utc>>,
    output_intent: Option<Json<OutputIntent>>,
    first_seen_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<StageRecordRow> for StageRecord {
    type Error = ManifestError;

    fn try_from(row: StageRecordRow) -> Result<Self, Self::Error> {
        Ok(StageRecord {
            id: row.id,
            dataset_id: row.dataset_id,
            stage: row.stage,
            object_key: row.object_key,
            state: row.state.parse()?,
            claim_token: row.claim_token,
            claim_expiry: row.claim_expiry,
            worker_id: row.worker_id,
            attempt_count: row.attempt_count,
            last_error: row.last_error,
            not_before: row.not_before,
            output_intent: row.output_intent.map(|Json(intent)| intent),
            first_seen_at: row.first_seen_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct DatasetRow {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
}

impl From<DatasetRow> for Dataset {
    fn from(row: DatasetRow) -> Self {
        Dataset {
            id: row.id,
            name: row.name,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ManifestRow {
    manifest_id: Uuid,
    dataset_id: Uuid,
    stage: i32,
    source_key: String,
    content_hash: String,
    published_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct EntryRow {
    manifest_id: Uuid,
    source_uri: String,
    output_uris: Vec<String>,
    variant_name: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    annotation_format: Option<String>,
    converter_version: Option<String>,
    normalization_policy_hash: Option<String>,
}

impl From<EntryRow> for ManifestEntry {
    fn from(row: EntryRow) -> Self {
        ManifestEntry {
            source_uri: row.source_uri,
            output_uris: row.output_uris,
            variant_name: row.variant_name,
            width: row.width,
            height: row.height,
            annotation_format: row.annotation_format,
            converter_version: row.converter_version,
            normalization_policy_hash: row.normalization_policy_hash,
        }
    }
}

/// Escape LIKE metacharacters and turn a key prefix into a pattern
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Manifest store over a shared PostgreSQL database
#[derive(Clone)]
pub struct PgManifestStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgManifestStore {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Open a connection pool with the configured limits
    pub async fn connect(config: &DatabaseConfig, retry: RetryPolicy) -> ManifestResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "Database connection pool established"
        );
        Ok(Self::new(pool, retry))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> ManifestResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn record_by_token(&self, token: Uuid) -> ManifestResult<Option<StageRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM stage_records WHERE claim_token = $1");
        sqlx::query_as::<_, StageRecordRow>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .map(StageRecord::try_from)
            .transpose()
    }

    /// Explain why the conditional claim matched nothing, parking the
    /// record Dead when an expired claim has used up its attempts
    async fn diagnose_failed_claim(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
    ) -> ManifestError {
        let park_sql = format!(
            "UPDATE stage_records
             SET state = 'dead', claim_token = NULL, claim_expiry = NULL,
                 last_error = 'claim expired after ' || attempt_count || ' attempts',
                 updated_at = NOW()
             WHERE dataset_id = $1 AND stage = $2 AND object_key = $3
               AND state IN ('claimed', 'staged')
               AND claim_expiry <= NOW()
               AND attempt_count >= $4
             RETURNING {RECORD_COLUMNS}"
        );
        let parked = sqlx::query_as::<_, StageRecordRow>(&park_sql)
            .bind(dataset_id)
            .bind(stage)
            .bind(key)
            .bind(self.retry.max_attempts)
            .fetch_optional(&self.pool)
            .await;

        match parked {
            Ok(Some(_)) => {
                warn!(%dataset_id, stage, key, "Expired claim exhausted its attempts, parked dead");
                return ManifestError::NotClaimable {
                    key: key.to_string(),
                    state: RecordState::Dead,
                };
            }
            Ok(None) => {}
            Err(e) => return e.into(),
        }

        let record = match self.get_record(dataset_id, stage, key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return ManifestError::RecordNotFound {
                    key: key.to_string(),
                    stage,
                }
            }
            Err(e) => return e,
        };

        match record.state {
            RecordState::Processed | RecordState::Dead => ManifestError::NotClaimable {
                key: key.to_string(),
                state: record.state,
            },
            RecordState::Failed => ManifestError::BackingOff {
                key: key.to_string(),
                not_before: record.not_before.unwrap_or(record.updated_at),
            },
            // Live claim, or a concurrent transition we lost the race to
            RecordState::Claimed | RecordState::Staged | RecordState::Pending => {
                ManifestError::AlreadyClaimed {
                    key: key.to_string(),
                    holder: record.worker_id,
                    expires_at: record.claim_expiry,
                }
            }
        }
    }

    async fn load_manifests(&self, rows: Vec<ManifestRow>) -> ManifestResult<Vec<Manifest>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.manifest_id).collect();
        let entry_rows = sqlx::query_as::<_, EntryRow>(
            "SELECT manifest_id, source_uri, output_uris, variant_name, width, height,
                    annotation_format, converter_version, normalization_policy_hash
             FROM manifest_entries
             WHERE manifest_id = ANY($1)
             ORDER BY manifest_id, position",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut entries: HashMap<Uuid, Vec<ManifestEntry>> = HashMap::new();
        for row in entry_rows {
            entries.entry(row.manifest_id).or_default().push(row.into());
        }

        Ok(rows
            .into_iter()
            .map(|row| Manifest {
                entries: entries.remove(&row.manifest_id).unwrap_or_default(),
                manifest_id: row.manifest_id,
                dataset_id: row.dataset_id,
                stage: row.stage,
                source_key: row.source_key,
                content_hash: row.content_hash,
                published_at: row.published_at,
            })
            .collect())
    }

    async fn insert_entries(
        tx: &mut Transaction<'_, Postgres>,
        manifest_id: Uuid,
        entries: &[ManifestEntry],
    ) -> ManifestResult<()> {
        for (position, entry) in entries.iter().enumerate() {
            sqlx::query(
                "INSERT INTO manifest_entries
                    (manifest_id, position, source_uri, output_uris, variant_name, width,
                     height, annotation_format, converter_version, normalization_policy_hash)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(manifest_id)
            .bind(position as i32)
            .bind(&entry.source_uri)
            .bind(&entry.output_uris)
            .bind(&entry.variant_name)
            .bind(entry.width)
            .bind(entry.height)
            .bind(&entry.annotation_format)
            .bind(&entry.converter_version)
            .bind(&entry.normalization_policy_hash)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ManifestStore for PgManifestStore {
    async fn now(&self) -> ManifestResult<DateTime<Utc>> {
        Ok(sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&self.pool)
            .await?)
    }

    #[instrument(skip(self))]
    async fn register_dataset(&self, name: &str) -> ManifestResult<Dataset> {
        if name.trim().is_empty() {
            return Err(ManifestError::InvalidInput("dataset name is empty".into()));
        }

        // The no-op update makes RETURNING yield the existing row too
        let row = sqlx::query_as::<_, DatasetRow>(
            "INSERT INTO datasets (id, name) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id, name, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_dataset_by_name(&self, name: &str) -> ManifestResult<Option<Dataset>> {
        let row = sqlx::query_as::<_, DatasetRow>(
            "SELECT id, name, created_at FROM datasets WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_datasets(&self) -> ManifestResult<Vec<Dataset>> {
        let rows = sqlx::query_as::<_, DatasetRow>(
            "SELECT id, name, created_at FROM datasets ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn register_pending(
        &self,
        dataset_id: Uuid,
        stage: i32,
        keys: &[String],
    ) -> ManifestResult<u64> {
        check_stage(stage)?;
        let unique: BTreeSet<&String> = keys.iter().collect();
        if unique.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = unique.iter().map(|_| Uuid::new_v4()).collect();
        let keys: Vec<String> = unique.into_iter().cloned().collect();

        let result = sqlx::query(
            "INSERT INTO stage_records (id, dataset_id, stage, object_key)
             SELECT id, $1, $2, key FROM UNNEST($3::uuid[], $4::text[]) AS t(id, key)
             ON CONFLICT (dataset_id, stage, object_key) DO NOTHING",
        )
        .bind(dataset_id)
        .bind(stage)
        .bind(&ids)
        .bind(&keys)
        .execute(&self.pool)
        .await?;

        debug!(created = result.rows_affected(), "Registered pending keys");
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, ttl))]
    async fn claim_for_processing(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
        ttl: Duration,
        worker_id: &str,
    ) -> ManifestResult<Claim> {
        check_stage(stage)?;
        let token = Uuid::new_v4();

        let sql = format!(
            "INSERT INTO stage_records
                (id, dataset_id, stage, object_key, state, claim_token, claim_expiry,
                 worker_id, attempt_count)
             VALUES ($1, $2, $3, $4, 'claimed', $5, NOW() + make_interval(secs => $6), $7, 1)
             ON CONFLICT (dataset_id, stage, object_key) DO UPDATE
             SET state = 'claimed',
                 claim_token = EXCLUDED.claim_token,
                 claim_expiry = EXCLUDED.claim_expiry,
                 worker_id = EXCLUDED.worker_id,
                 attempt_count = stage_records.attempt_count + 1,
                 not_before = NULL,
                 updated_at = NOW()
             WHERE stage_records.state = 'pending'
                OR (stage_records.state = 'failed'
                    AND (stage_records.not_before IS NULL OR stage_records.not_before <= NOW()))
                OR (stage_records.state IN ('claimed', 'staged')
                    AND stage_records.claim_expiry <= NOW()
                    AND stage_records.attempt_count < $8)
             RETURNING {RECORD_COLUMNS}"
        );

        let row = sqlx::query_as::<_, StageRecordRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(dataset_id)
            .bind(stage)
            .bind(key)
            .bind(token)
            .bind(ttl.as_secs_f64())
            .bind(worker_id)
            .bind(self.retry.max_attempts)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Err(self.diagnose_failed_claim(dataset_id, stage, key).await);
        };

        let record = StageRecord::try_from(row)?;
        let expires_at = record.claim_expiry.unwrap_or_else(Utc::now);
        debug!(%token, attempt = record.attempt_count, "Claimed key");

        Ok(Claim {
            token,
            expires_at,
            record,
        })
    }

    async fn heartbeat(&self, token: Uuid, ttl: Duration) -> ManifestResult<DateTime<Utc>> {
        let expiry: Option<DateTime<Utc>> = sqlx::query_scalar(
            "UPDATE stage_records
             SET claim_expiry = NOW() + make_interval(secs => $2), updated_at = NOW()
             WHERE claim_token = $1 AND state IN ('claimed', 'staged')
             RETURNING claim_expiry",
        )
        .bind(token)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        expiry.ok_or(ManifestError::ClaimLost(token))
    }

    async fn mark_staged(&self, token: Uuid) -> ManifestResult<()> {
        let result = sqlx::query(
            "UPDATE stage_records SET state = 'staged', updated_at = NOW()
             WHERE claim_token = $1 AND state IN ('claimed', 'staged')",
        )
        .bind(token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ManifestError::ClaimLost(token));
        }
        Ok(())
    }

    async fn record_output_intent(
        &self,
        token: Uuid,
        intent: &OutputIntent,
    ) -> ManifestResult<()> {
        let result = sqlx::query(
            "UPDATE stage_records SET output_intent = $2, updated_at = NOW()
             WHERE claim_token = $1 AND state IN ('claimed', 'staged')",
        )
        .bind(token)
        .bind(Json(intent))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ManifestError::ClaimLost(token));
        }
        Ok(())
    }

    #[instrument(skip(self, entries, content_hash), fields(entries = entries.len()))]
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

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, ManifestRow>(&format!(
            "INSERT INTO manifests (manifest_id, dataset_id, stage, source_key, content_hash)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (dataset_id, stage, source_key) DO NOTHING
             RETURNING {MANIFEST_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(dataset_id)
        .bind(stage)
        .bind(source_key)
        .bind(&content_hash)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = inserted {
            Self::insert_entries(&mut tx, row.manifest_id, entries).await?;
            tx.commit().await?;
            info!(manifest_id = %row.manifest_id, "Published manifest");
            return Ok(Manifest {
                manifest_id: row.manifest_id,
                dataset_id: row.dataset_id,
                stage: row.stage,
                source_key: row.source_key,
                entries: entries.to_vec(),
                content_hash: row.content_hash,
                published_at: row.published_at,
            });
        }
        tx.rollback().await?;

        let existing = self
            .get_manifest(dataset_id, stage, source_key)
            .await?
            .ok_or_else(|| ManifestError::NotPublished {
                key: source_key.to_string(),
                stage,
            })?;

        if existing.content_hash != content_hash {
            return Err(ManifestError::Conflict {
                key: source_key.to_string(),
                existing_hash: existing.content_hash,
                attempted_hash: content_hash,
            });
        }

        debug!(manifest_id = %existing.manifest_id, "Manifest already published with identical content");
        Ok(existing)
    }

    async fn mark_processed(&self, token: Uuid) -> ManifestResult<StageRecord> {
        let sql = format!(
            "UPDATE stage_records r
             SET state = 'processed', claim_token = NULL, claim_expiry = NULL,
                 not_before = NULL, processed_at = NOW(), updated_at = NOW()
             WHERE r.claim_token = $1 AND r.state IN ('claimed', 'staged')
               AND EXISTS (
                   SELECT 1 FROM manifests m
                   WHERE m.dataset_id = r.dataset_id
                     AND m.stage = r.stage
                     AND m.source_key = r.object_key)
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query_as::<_, StageRecordRow>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.try_into(),
            None => match self.record_by_token(token).await? {
                Some(record) => Err(ManifestError::NotPublished {
                    key: record.object_key,
                    stage: record.stage,
                }),
                None => Err(ManifestError::ClaimLost(token)),
            },
        }
    }

    #[instrument(skip(self, error))]
    async fn fail(
        &self,
        token: Uuid,
        error: &str,
        action: FailureAction,
    ) -> ManifestResult<StageRecord> {
        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT {RECORD_COLUMNS} FROM stage_records
             WHERE claim_token = $1 AND state IN ('claimed', 'staged')
             FOR UPDATE"
        );
        let record: StageRecord = sqlx::query_as::<_, StageRecordRow>(&select)
            .bind(token)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ManifestError::ClaimLost(token))?
            .try_into()?;

        let now: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&mut *tx)
            .await?;
        let (state, not_before) = failure_transition(&self.retry, record.attempt_count, action, now);

        let update = format!(
            "UPDATE stage_records
             SET state = $2, not_before = $3, last_error = $4,
                 claim_token = NULL, claim_expiry = NULL, updated_at = NOW()
             WHERE id = $1
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query_as::<_, StageRecordRow>(&update)
            .bind(record.id)
            .bind(state.as_str())
            .bind(not_before)
            .bind(error)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        if state == RecordState::Dead {
            warn!(key = %record.object_key, attempts = record.attempt_count, "Record parked dead");
        }
        row.try_into()
    }

    async fn requeue(&self, token: Uuid, reason: &str) -> ManifestResult<StageRecord> {
        let sql = format!(
            "UPDATE stage_records
             SET state = 'pending', claim_token = NULL, claim_expiry = NULL,
                 attempt_count = GREATEST(attempt_count - 1, 0),
                 last_error = $2, updated_at = NOW()
             WHERE claim_token = $1 AND state IN ('claimed', 'staged')
             RETURNING {RECORD_COLUMNS}"
        );
        sqlx::query_as::<_, StageRecordRow>(&sql)
            .bind(token)
            .bind(reason)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ManifestError::ClaimLost(token))?
            .try_into()
    }

    async fn get_record(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
    ) -> ManifestResult<Option<StageRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM stage_records
             WHERE dataset_id = $1 AND stage = $2 AND object_key = $3"
        );
        sqlx::query_as::<_, StageRecordRow>(&sql)
            .bind(dataset_id)
            .bind(stage)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .map(StageRecord::try_from)
            .transpose()
    }

    async fn get_manifest(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
    ) -> ManifestResult<Option<Manifest>> {
        let rows = sqlx::query_as::<_, ManifestRow>(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM manifests
             WHERE dataset_id = $1 AND stage = $2 AND source_key = $3"
        ))
        .bind(dataset_id)
        .bind(stage)
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        Ok(self.load_manifests(rows).await?.into_iter().next())
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
        let pattern = like_prefix(prefix);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let keys = if stage == 1 {
            sqlx::query_scalar::<_, String>(
                r#"SELECT object_key FROM stage_records
                   WHERE dataset_id = $1 AND stage = 1
                     AND state NOT IN ('processed', 'dead')
                     AND object_key LIKE $2 ESCAPE '\'
                     AND ($3::text IS NULL OR object_key > $3)
                   ORDER BY object_key
                   LIMIT $4"#,
            )
            .bind(dataset_id)
            .bind(&pattern)
            .bind(start_after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            // Stage N only sees keys whose stage N-1 record is Processed
            sqlx::query_scalar::<_, String>(
                r#"SELECT prev.object_key FROM stage_records prev
                   LEFT JOIN stage_records cur
                     ON cur.dataset_id = prev.dataset_id
                    AND cur.stage = $5
                    AND cur.object_key = prev.object_key
                   WHERE prev.dataset_id = $1 AND prev.stage = $5 - 1
                     AND prev.state = 'processed'
                     AND (cur.id IS NULL OR cur.state NOT IN ('processed', 'dead'))
                     AND prev.object_key LIKE $2 ESCAPE '\'
                     AND ($3::text IS NULL OR prev.object_key > $3)
                   ORDER BY prev.object_key
                   LIMIT $4"#,
            )
            .bind(dataset_id)
            .bind(&pattern)
            .bind(start_after)
            .bind(limit)
            .bind(stage)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(keys)
    }

    async fn get_manifest_chain(&self, dataset_id: Uuid) -> ManifestResult<Vec<Manifest>> {
        let rows = sqlx::query_as::<_, ManifestRow>(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM manifests
             WHERE dataset_id = $1
             ORDER BY stage, source_key"
        ))
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await?;

        self.load_manifests(rows).await
    }

    async fn get_key_lineage(&self, dataset_id: Uuid, key: &str) -> ManifestResult<Vec<Manifest>> {
        let rows = sqlx::query_as::<_, ManifestRow>(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM manifests
             WHERE dataset_id = $1 AND source_key = $2
             ORDER BY stage"
        ))
        .bind(dataset_id)
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        self.load_manifests(rows).await
    }

    async fn list_dead(
        &self,
        dataset_id: Uuid,
        stage: Option<i32>,
    ) -> ManifestResult<Vec<StageRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM stage_records
             WHERE dataset_id = $1 AND state = 'dead'
               AND ($2::int IS NULL OR stage = $2)
             ORDER BY stage, object_key"
        );
        sqlx::query_as::<_, StageRecordRow>(&sql)
            .bind(dataset_id)
            .bind(stage)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(StageRecord::try_from)
            .collect()
    }

    #[instrument(skip(self))]
    async fn revive(
        &self,
        dataset_id: Uuid,
        stage: i32,
        key: &str,
    ) -> ManifestResult<StageRecord> {
        let sql = format!(
            "UPDATE stage_records
             SET state = 'pending', attempt_count = 0, not_before = NULL, updated_at = NOW()
             WHERE dataset_id = $1 AND stage = $2 AND object_key = $3 AND state = 'dead'
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query_as::<_, StageRecordRow>(&sql)
            .bind(dataset_id)
            .bind(stage)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                info!("Revived dead record");
                row.try_into()
            }
            None => match self.get_record(dataset_id, stage, key).await? {
                Some(record) => Err(ManifestError::InvalidInput(format!(
                    "'{key}' is {}, only dead records can be revived",
                    record.state
                ))),
                None => Err(ManifestError::RecordNotFound {
                    key: key.to_string(),
                    stage,
                }),
            },
        }
    }

    async fn stage_summary(&self, dataset_id: Uuid, stage: i32) -> ManifestResult<StageSummary> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM stage_records
             WHERE dataset_id = $1 AND stage = $2
             GROUP BY state",
        )
        .bind(dataset_id)
        .bind(stage)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = StageSummary::default();
        for (state, count) in rows {
            summary.add(state.parse()?, count.max(0) as u64);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_prefix_escapes_metacharacters() {
        assert_eq!(like_prefix(""), "%");
        assert_eq!(like_prefix("drone/"), "drone/%");
        assert_eq!(like_prefix("100%_a\\b"), "100\\%\\_a\\\\b%");
    }
}

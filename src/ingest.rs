//! Ingestion run orchestration.
//!
//! One run takes a batch of raw records through:
//!
//! ```text
//! parse → normalize → lock sites → fingerprint → embed stale → upsert → soft delete → unlock
//! ```
//!
//! Invalid records are skipped with a warning. Objects whose text is
//! unchanged since the stored vector was computed are not re-embedded.
//! Items the model fails on are stored without a vector and picked up by
//! `finder embed pending`. A store failure that survives its retries aborts
//! the run; what was written stays written, the report says how far it got,
//! and no soft delete happens.
//!
//! Site locks are refreshed while objects are written and checked again
//! right before the soft delete. A run whose lock was taken over stops
//! writing and leaves deactivation to the run that now owns the site.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::{Config, IngestConfig};
use crate::embedding::Embedder;
use crate::error::FinderError;
use crate::models::{ContentObject, NaturalKey, RawRecord};
use crate::normalize::normalize_record;
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{IndexStore, NewEmbedding, SqliteStore};

const STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upserts between two lock refreshes.
const LOCK_HEARTBEAT_EVERY: usize = 64;

/// Parse a JSON array or JSON-lines document.
///
/// A record that does not deserialize is returned as a validation error in
/// its slot so the rest of the batch still goes through.
pub fn parse_records(content: &str) -> Result<Vec<Result<RawRecord, FinderError>>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        let values: Vec<serde_json::Value> =
            serde_json::from_str(trimmed).context("Failed to parse JSON array of records")?;
        return Ok(values
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                serde_json::from_value(v)
                    .map_err(|e| FinderError::validation(format!("record {}", i + 1), e.to_string()))
            })
            .collect());
    }

    Ok(content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| FinderError::validation(format!("line {}", i + 1), e.to_string()))
        })
        .collect())
}

pub fn read_records(path: &Path) -> Result<Vec<Result<RawRecord, FinderError>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read records file: {}", path.display()))?;
    parse_records(&content)
}

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Reject records for any other site.
    pub site: Option<String>,
    pub dry_run: bool,
    /// Fixed run id; a fresh UUID when `None`.
    pub run_id: Option<String>,
    /// Clock override; `Utc::now()` when `None`.
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub run_id: String,
    pub sites: Vec<String>,
    pub received: usize,
    pub skipped_invalid: usize,
    pub upserted: usize,
    /// Upserted objects whose stored record was already identical.
    pub unchanged: usize,
    pub embedded: usize,
    pub embedding_failed: usize,
    pub embedding_reused: usize,
    pub deactivated: u64,
    /// A store failure or a lost site lock stopped the run early.
    pub aborted: bool,
    pub dry_run: bool,
}

pub struct Ingestor {
    store: Arc<dyn IndexStore>,
    embedder: Arc<Embedder>,
    lock_ttl_secs: i64,
    store_policy: RetryPolicy,
}

impl Ingestor {
    pub fn new(store: Arc<dyn IndexStore>, embedder: Arc<Embedder>, config: &IngestConfig) -> Self {
        Self {
            store,
            embedder,
            lock_ttl_secs: config.lock_ttl_secs,
            store_policy: RetryPolicy::new(config.store_retries, STORE_TIMEOUT),
        }
    }

    pub fn with_store_backoff(mut self, base_delay: Duration) -> Self {
        self.store_policy = self.store_policy.with_base_delay(base_delay);
        self
    }

    /// Run one ingestion over `records`.
    ///
    /// Fails with [`FinderError::IngestLocked`] when another live run holds
    /// a site's lock, and with [`FinderError::DimensionMismatch`] when the
    /// model returns vectors of the wrong size.
    pub async fn run(
        &self,
        records: Vec<Result<RawRecord, FinderError>>,
        opts: &IngestOptions,
    ) -> Result<IngestReport> {
        let run_id = opts
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = opts.now.unwrap_or_else(Utc::now);

        let mut report = IngestReport {
            run_id: run_id.clone(),
            received: records.len(),
            dry_run: opts.dry_run,
            ..Default::default()
        };

        // Later duplicates of a key replace earlier ones.
        let mut objects: BTreeMap<NaturalKey, ContentObject> = BTreeMap::new();
        for record in records {
            match record.and_then(|raw| normalize_record(&raw, opts.site.as_deref())) {
                Ok(obj) => {
                    objects.insert(obj.key(), obj);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping record");
                    report.skipped_invalid += 1;
                }
            }
        }

        let sites: BTreeSet<String> = objects.keys().map(|k| k.site_id.clone()).collect();
        report.sites = sites.iter().cloned().collect();

        if opts.dry_run {
            let keys: Vec<NaturalKey> = objects.keys().cloned().collect();
            let stored = self.store.fingerprints(&keys).await?;
            let model = self.embedder.model_name();
            for (key, obj) in &objects {
                match stored.get(key) {
                    Some(fp) if fp.embedding_fresh(&obj.text_hash, model) => {
                        report.embedding_reused += 1;
                        if fp.record_hash == obj.record_hash && fp.is_active {
                            report.unchanged += 1;
                        }
                    }
                    _ => {}
                }
            }
            report.upserted = objects.len();
            return Ok(report);
        }

        let started = Instant::now();
        let mut locked: Vec<&str> = Vec::new();
        for site in &sites {
            let acquired = self
                .store
                .try_acquire_lock(site, &run_id, now, self.lock_ttl_secs)
                .await;
            match acquired {
                Ok(true) => locked.push(site),
                Ok(false) => {
                    self.release_locks(&locked, &run_id).await;
                    return Err(FinderError::IngestLocked {
                        site_id: site.clone(),
                    }
                    .into());
                }
                Err(e) => {
                    self.release_locks(&locked, &run_id).await;
                    return Err(e);
                }
            }
        }

        let clock = RunClock { now, started };
        let outcome = self.write(&objects, &sites, &run_id, clock, &mut report).await;
        self.release_locks(&locked, &run_id).await;
        outcome?;

        tracing::info!(
            run_id = %report.run_id,
            received = report.received,
            skipped = report.skipped_invalid,
            upserted = report.upserted,
            unchanged = report.unchanged,
            embedded = report.embedded,
            embedding_failed = report.embedding_failed,
            deactivated = report.deactivated,
            aborted = report.aborted,
            "ingestion run finished"
        );
        Ok(report)
    }

    async fn write(
        &self,
        objects: &BTreeMap<NaturalKey, ContentObject>,
        sites: &BTreeSet<String>,
        run_id: &str,
        clock: RunClock,
        report: &mut IngestReport,
    ) -> Result<()> {
        let now = clock.now;
        let keys: Vec<NaturalKey> = objects.keys().cloned().collect();
        let stored = with_retry("fingerprint read", &self.store_policy, || {
            self.store.fingerprints(&keys)
        })
        .await?;

        let model = self.embedder.model_name().to_string();
        let mut stale: Vec<&ContentObject> = Vec::new();
        for (key, obj) in objects {
            match stored.get(key) {
                Some(fp) if fp.embedding_fresh(&obj.text_hash, &model) => {
                    report.embedding_reused += 1;
                }
                _ => stale.push(obj),
            }
        }

        let texts: Vec<String> = stale.iter().map(|o| o.text_blob.clone()).collect();
        let vectors = self.embedder.embed_all(&texts).await?;
        let mut fresh: BTreeMap<NaturalKey, Vec<f32>> = BTreeMap::new();
        for (obj, vector) in stale.iter().zip(vectors) {
            match vector {
                Some(v) => {
                    report.embedded += 1;
                    fresh.insert(obj.key(), v);
                }
                None => report.embedding_failed += 1,
            }
        }

        for (key, obj) in objects {
            let embedding = fresh.get(key).map(|v| NewEmbedding {
                vector: v,
                model: &model,
            });
            let written = with_retry("object upsert", &self.store_policy, || {
                self.store.upsert_object(obj, embedding, run_id, now)
            })
            .await;

            if let Err(e) = written {
                tracing::warn!(
                    key = %key,
                    error = %format!("{:#}", e),
                    written = report.upserted,
                    "store unavailable, aborting ingestion run"
                );
                report.aborted = true;
                return Ok(());
            }

            report.upserted += 1;
            if let Some(fp) = stored.get(key) {
                if fp.record_hash == obj.record_hash && fp.is_active {
                    report.unchanged += 1;
                }
            }

            if report.upserted % LOCK_HEARTBEAT_EVERY == 0
                && !self.heartbeat(sites, run_id, clock.elapsed()).await?
            {
                report.aborted = true;
                return Ok(());
            }
        }

        if !self.heartbeat(sites, run_id, clock.elapsed()).await? {
            report.aborted = true;
            return Ok(());
        }

        for site in sites {
            let deactivated = with_retry("soft delete", &self.store_policy, || {
                self.store.deactivate_unseen(site, run_id)
            })
            .await?;
            if deactivated > 0 {
                tracing::info!(site = %site, deactivated, "objects missing upstream marked inactive");
            }
            report.deactivated += deactivated;
        }

        Ok(())
    }

    /// Refresh every site lock held by `run_id`. Returns `false` when one of
    /// them was taken over by another run.
    async fn heartbeat(
        &self,
        sites: &BTreeSet<String>,
        run_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        for site in sites {
            let owned = with_retry("lock refresh", &self.store_policy, || {
                self.store.refresh_lock(site, run_id, at)
            })
            .await?;
            if !owned {
                tracing::warn!(
                    site = %site,
                    run_id = %run_id,
                    "ingestion lock taken over by another run, stopping before soft delete"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn release_locks(&self, sites: &[&str], run_id: &str) {
        for site in sites {
            if let Err(e) = self.store.release_lock(site, run_id).await {
                tracing::warn!(site = %site, error = %e, "failed to release ingestion lock");
            }
        }
    }
}

/// Run start on the run's clock plus a monotonic timer, so lock refreshes
/// advance even when the clock is pinned.
#[derive(Debug, Clone, Copy)]
struct RunClock {
    now: DateTime<Utc>,
    started: Instant,
}

impl RunClock {
    fn elapsed(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.now + elapsed
    }
}

/// `finder ingest <file>`: run one ingestion and print the report.
pub async fn run_ingest(
    config: &Config,
    path: &Path,
    site: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let records = read_records(path)?;
    let store = SqliteStore::open(config).await?;
    let embedder = Arc::new(Embedder::from_config(&config.embedding)?);
    let ingestor = Ingestor::new(Arc::new(store.clone()), Arc::clone(&embedder), &config.ingest);

    let opts = IngestOptions {
        site,
        dry_run,
        ..Default::default()
    };
    let report = ingestor.run(records, &opts).await?;
    if !dry_run && report.upserted > 0 {
        store.record_model(embedder.model_name()).await?;
    }

    if dry_run {
        println!("ingest {} (dry-run)", path.display());
    } else {
        println!("ingest {}", path.display());
        println!("  run: {}", report.run_id);
    }
    println!("  received: {}", report.received);
    println!("  skipped invalid: {}", report.skipped_invalid);
    println!("  upserted: {}", report.upserted);
    println!("  unchanged: {}", report.unchanged);
    if !dry_run {
        println!("  embedded: {}", report.embedded);
        println!("  embedding reused: {}", report.embedding_reused);
        println!("  embedding failed: {}", report.embedding_failed);
        println!("  deactivated: {}", report.deactivated);
    }
    if report.aborted {
        println!("aborted: store unavailable, partial completion");
    } else {
        println!("ok");
    }

    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::db;
    use crate::embedding::tests::PoisonProvider;
    use crate::embedding::HashProvider;
    use crate::migrate;
    use crate::store::{Fingerprint, PendingEmbedding, RetrievalStore};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        _tmp: tempfile::TempDir,
        store: SqliteStore,
        ingestor: Ingestor,
    }

    fn ingestor_over(
        store: Arc<dyn IndexStore>,
        provider: Arc<dyn crate::embedding::EmbeddingProvider>,
    ) -> Ingestor {
        let embedding = EmbeddingConfig {
            dims: 32,
            batch_size: 2,
            max_retries: 0,
            ..Default::default()
        };
        let embedder = Arc::new(
            Embedder::new(provider, &embedding).with_backoff(Duration::from_millis(1)),
        );
        Ingestor::new(store, embedder, &IngestConfig::default())
            .with_store_backoff(Duration::from_millis(1))
    }

    async fn harness_with(provider: Arc<dyn crate::embedding::EmbeddingProvider>) -> Harness {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("i.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let store = SqliteStore::new(pool);
        let ingestor = ingestor_over(Arc::new(store.clone()), provider);
        Harness {
            _tmp: tmp,
            store,
            ingestor,
        }
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(HashProvider::new(32))).await
    }

    /// Delegates to SQLite, failing upserts after `fail_after` writes or
    /// handing the lock to another run after `steal_after` writes.
    struct FaultyStore {
        inner: SqliteStore,
        fail_after: Option<usize>,
        steal_after: Option<usize>,
        upserts: AtomicUsize,
    }

    impl FaultyStore {
        fn new(inner: SqliteStore) -> Self {
            Self {
                inner,
                fail_after: None,
                steal_after: None,
                upserts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IndexStore for FaultyStore {
        async fn try_acquire_lock(
            &self,
            site_id: &str,
            run_id: &str,
            now: DateTime<Utc>,
            ttl_secs: i64,
        ) -> Result<bool> {
            self.inner.try_acquire_lock(site_id, run_id, now, ttl_secs).await
        }
        async fn release_lock(&self, site_id: &str, run_id: &str) -> Result<()> {
            self.inner.release_lock(site_id, run_id).await
        }
        async fn refresh_lock(
            &self,
            site_id: &str,
            run_id: &str,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            self.inner.refresh_lock(site_id, run_id, now).await
        }
        async fn fingerprints(
            &self,
            keys: &[NaturalKey],
        ) -> Result<HashMap<NaturalKey, Fingerprint>> {
            self.inner.fingerprints(keys).await
        }
        async fn upsert_object(
            &self,
            obj: &ContentObject,
            embedding: Option<NewEmbedding<'_>>,
            run_id: &str,
            now: DateTime<Utc>,
        ) -> Result<()> {
            let attempt = self.upserts.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|n| attempt >= n) {
                return Err(FinderError::Store("disk unavailable".into()).into());
            }
            self.inner.upsert_object(obj, embedding, run_id, now).await?;
            if self.steal_after == Some(attempt + 1) {
                // a later run finds the lock stale
                let taken = self
                    .inner
                    .try_acquire_lock(&obj.site_id, "thief", t(100_000), 60)
                    .await?;
                assert!(taken);
            }
            Ok(())
        }
        async fn deactivate_unseen(&self, site_id: &str, run_id: &str) -> Result<u64> {
            self.inner.deactivate_unseen(site_id, run_id).await
        }
        async fn pending_embeddings(
            &self,
            model: &str,
            limit: usize,
        ) -> Result<Vec<PendingEmbedding>> {
            self.inner.pending_embeddings(model, limit).await
        }
        async fn set_embedding(
            &self,
            id: i64,
            text_hash: &str,
            vector: &[f32],
            model: &str,
        ) -> Result<bool> {
            self.inner.set_embedding(id, text_hash, vector, model).await
        }
        async fn clear_embeddings(&self) -> Result<u64> {
            self.inner.clear_embeddings().await
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn opts(run: &str, secs: i64) -> IngestOptions {
        IngestOptions {
            run_id: Some(run.into()),
            now: Some(t(secs)),
            ..Default::default()
        }
    }

    fn rec(id: &str, title: &str, owner: &str) -> Result<RawRecord, FinderError> {
        Ok(RawRecord {
            site_id: Some("s1".into()),
            object_type: Some("workbook".into()),
            object_id: Some(id.into()),
            title: Some(title.into()),
            owner: Some(owner.into()),
            project_name: Some("Finance".into()),
            ..Default::default()
        })
    }

    fn key(id: &str) -> NaturalKey {
        NaturalKey {
            site_id: "s1".into(),
            object_type: crate::models::ObjectType::Workbook,
            object_id: id.into(),
        }
    }

    #[tokio::test]
    async fn test_rerun_of_same_batch_changes_nothing() {
        let h = harness().await;
        let batch = || vec![rec("w1", "Q3 Sales", "ana"), rec("w2", "Churn", "bo")];

        let first = h.ingestor.run(batch(), &opts("r1", 0)).await.unwrap();
        assert_eq!(first.upserted, 2);
        assert_eq!(first.embedded, 2);
        assert_eq!(first.unchanged, 0);
        let (_, before) = h.store.get_object(&key("w1")).await.unwrap().unwrap();

        let second = h.ingestor.run(batch(), &opts("r2", 100)).await.unwrap();
        assert_eq!(second.upserted, 2);
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.embedded, 0);
        assert_eq!(second.embedding_reused, 2);
        assert_eq!(second.deactivated, 0);

        let (_, after) = h.store.get_object(&key("w1")).await.unwrap().unwrap();
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.embedding, before.embedding);
    }

    #[tokio::test]
    async fn test_owner_change_reuses_embedding() {
        let h = harness().await;
        h.ingestor
            .run(vec![rec("w1", "Q3 Sales", "ana")], &opts("r1", 0))
            .await
            .unwrap();
        let report = h
            .ingestor
            .run(vec![rec("w1", "Q3 Sales", "bo")], &opts("r2", 60))
            .await
            .unwrap();
        assert_eq!(report.embedded, 0);
        assert_eq!(report.embedding_reused, 1);
        assert_eq!(report.unchanged, 0);

        let (_, obj) = h.store.get_object(&key("w1")).await.unwrap().unwrap();
        assert_eq!(obj.owner, "bo");
        assert_eq!(obj.updated_at, Some(t(60)));
        assert!(obj.embedding.is_some());
    }

    #[tokio::test]
    async fn test_missing_objects_are_soft_deleted() {
        let h = harness().await;
        h.ingestor
            .run(vec![rec("w1", "Q3 Sales", "ana"), rec("w2", "Churn", "bo")], &opts("r1", 0))
            .await
            .unwrap();
        let report = h
            .ingestor
            .run(vec![rec("w1", "Q3 Sales", "ana")], &opts("r2", 10))
            .await
            .unwrap();
        assert_eq!(report.deactivated, 1);

        let (_, gone) = h.store.get_object(&key("w2")).await.unwrap().unwrap();
        assert!(!gone.is_active);

        // back upstream: reactivated
        let report = h
            .ingestor
            .run(vec![rec("w1", "Q3 Sales", "ana"), rec("w2", "Churn", "bo")], &opts("r3", 20))
            .await
            .unwrap();
        assert_eq!(report.deactivated, 0);
        let (_, back) = h.store.get_object(&key("w2")).await.unwrap().unwrap();
        assert!(back.is_active);
        assert_eq!(back.updated_at, Some(t(20)));
    }

    #[tokio::test]
    async fn test_invalid_records_are_skipped() {
        let h = harness().await;
        let no_title = Ok(RawRecord {
            site_id: Some("s1".into()),
            object_type: Some("view".into()),
            object_id: Some("v1".into()),
            ..Default::default()
        });
        let unparsable = Err(FinderError::validation("line 3", "expected value"));
        let report = h
            .ingestor
            .run(vec![rec("w1", "Q3 Sales", "ana"), no_title, unparsable], &opts("r1", 0))
            .await
            .unwrap();
        assert_eq!(report.received, 3);
        assert_eq!(report.skipped_invalid, 2);
        assert_eq!(report.upserted, 1);
    }

    #[tokio::test]
    async fn test_held_lock_rejects_run() {
        let h = harness().await;
        assert!(h.store.try_acquire_lock("s1", "other", t(0), 3600).await.unwrap());
        let err = h
            .ingestor
            .run(vec![rec("w1", "Q3 Sales", "ana")], &opts("r1", 5))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FinderError>(),
            Some(FinderError::IngestLocked { .. })
        ));
        assert!(h.store.get_object(&key("w1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_embedding_keeps_object_lexical() {
        let h = harness_with(Arc::new(PoisonProvider::new(32))).await;
        let report = h
            .ingestor
            .run(
                vec![rec("w1", "Q3 Sales", "ana"), rec("w2", "poison chart", "bo")],
                &opts("r1", 0),
            )
            .await
            .unwrap();
        assert_eq!(report.upserted, 2);
        assert_eq!(report.embedded, 1);
        assert_eq!(report.embedding_failed, 1);

        let pending = h.store.pending_embeddings("poison-test", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].text_blob.contains("poison"));

        let hits = h
            .store
            .lexical_search("\"poison\"", &Default::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let h = harness().await;
        let report = h
            .ingestor
            .run(
                vec![rec("w1", "Q3 Sales", "ana")],
                &IngestOptions {
                    dry_run: true,
                    ..opts("r1", 0)
                },
            )
            .await
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.upserted, 1);
        assert!(h.store.get_object(&key("w1")).await.unwrap().is_none());
    }

    #[test]
    fn test_parse_json_lines_keeps_bad_line_as_error() {
        let content = r#"{"site_id":"s1","object_type":"view","object_id":"v1","title":"A"}

not json
{"site_id":"s1","object_type":"view","object_id":"v2","title":"B"}"#;
        let records = parse_records(content).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].is_ok());
        assert!(records[1].is_err());
        assert!(records[2].is_ok());
    }

    #[test]
    fn test_parse_json_array() {
        let records =
            parse_records(r#"[{"site_id":"s1","object_type":"view","id":"v1","name":"A"}, 42]"#)
                .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].as_ref().unwrap().object_id.as_deref(), Some("v1"));
        assert!(records[1].is_err());
    }

    fn batch(n: usize) -> Vec<Result<RawRecord, FinderError>> {
        (0..n)
            .map(|i| rec(&format!("w{}", i), &format!("Workbook {}", i), "ana"))
            .collect()
    }

    #[tokio::test]
    async fn test_store_failure_aborts_without_soft_delete() {
        let h = harness().await;
        // earlier run stored w0..w4; the next upstream batch drops w4
        h.ingestor.run(batch(5), &opts("r1", 0)).await.unwrap();

        let faulty = Arc::new(FaultyStore {
            fail_after: Some(2),
            ..FaultyStore::new(h.store.clone())
        });
        let ingestor = ingestor_over(faulty.clone(), Arc::new(HashProvider::new(32)));
        let report = ingestor.run(batch(4), &opts("r2", 10)).await.unwrap();

        assert!(report.aborted);
        assert_eq!(report.upserted, 2);
        assert_eq!(report.deactivated, 0);
        let retries = IngestConfig::default().store_retries as usize;
        assert_eq!(faulty.upserts.load(Ordering::SeqCst), 2 + 1 + retries);

        // lock released, nothing soft-deleted
        assert!(h.store.try_acquire_lock("s1", "next", t(11), 3600).await.unwrap());
        for i in 0..5 {
            let (_, obj) = h.store.get_object(&key(&format!("w{}", i))).await.unwrap().unwrap();
            assert!(obj.is_active);
        }
    }

    #[tokio::test]
    async fn test_lost_lock_skips_soft_delete() {
        let h = harness().await;
        h.ingestor.run(batch(3), &opts("r1", 0)).await.unwrap();

        let faulty = Arc::new(FaultyStore {
            steal_after: Some(1),
            ..FaultyStore::new(h.store.clone())
        });
        let ingestor = ingestor_over(faulty, Arc::new(HashProvider::new(32)));
        let report = ingestor.run(batch(2), &opts("r2", 10)).await.unwrap();

        assert!(report.aborted);
        assert_eq!(report.upserted, 2);
        assert_eq!(report.deactivated, 0);
        let (_, w2) = h.store.get_object(&key("w2")).await.unwrap().unwrap();
        assert!(w2.is_active);

        // the new owner keeps its lock
        assert!(!h.store.try_acquire_lock("s1", "next", t(100_001), 3600).await.unwrap());
        assert!(h.store.refresh_lock("s1", "thief", t(100_002)).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_long_run_lock() {
        let h = harness().await;
        let report = h
            .ingestor
            .run(batch(LOCK_HEARTBEAT_EVERY + 1), &opts("r1", 0))
            .await
            .unwrap();
        assert!(!report.aborted);
        assert_eq!(report.upserted, LOCK_HEARTBEAT_EVERY + 1);
    }
}

//! Persistent index storage.
//!
//! Two traits split the store by direction:
//!
//! | Trait | Used by | Operations |
//! |-------|---------|------------|
//! | [`IndexStore`] | ingestion, embedding backfill | lock, fingerprint, upsert, soft delete, embedding writes |
//! | [`RetrievalStore`] | query planner | lexical search, vector snapshot, hydration |
//!
//! [`SqliteStore`] implements both over the schema in [`crate::migrate`].
//! Every write is a single statement or a single transaction; readers see
//! WAL snapshots and never wait on an in-flight ingestion run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};

use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::FinderError;
use crate::migrate;
use crate::models::{ContentObject, NaturalKey, ObjectRef, ObjectType, SearchFilters};

/// A retrieval candidate with its un-normalised score.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Store surrogate id; stable for the life of the row.
    pub id: i64,
    pub object: ObjectRef,
    /// `-bm25` on the lexical path, cosine similarity on the semantic path.
    pub raw_score: f64,
}

/// What the store currently holds for a natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub text_hash: String,
    pub record_hash: String,
    /// `text_hash` the stored vector was computed from, if any.
    pub embedding_hash: Option<String>,
    pub embedding_model: Option<String>,
    pub is_active: bool,
}

impl Fingerprint {
    /// Whether the stored vector is still valid for `text_hash` under `model`.
    pub fn embedding_fresh(&self, text_hash: &str, model: &str) -> bool {
        self.embedding_hash.as_deref() == Some(text_hash)
            && self.embedding_model.as_deref() == Some(model)
    }
}

/// An active object whose vector is missing, stale or from another model.
#[derive(Debug, Clone)]
pub struct PendingEmbedding {
    pub id: i64,
    pub text_blob: String,
    pub text_hash: String,
}

/// Ids and vectors of every active embedded object, read in one transaction.
#[derive(Debug, Clone, Default)]
pub struct VectorSnapshot {
    pub generation: i64,
    pub ids: Vec<i64>,
    pub vectors: Vec<Vec<f32>>,
}

/// A vector supplied with an upsert.
#[derive(Debug, Clone, Copy)]
pub struct NewEmbedding<'a> {
    pub vector: &'a [f32],
    pub model: &'a str,
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Take the per-site writer lock. Returns `false` when another live run
    /// holds it; locks older than `ttl_secs` are taken over.
    async fn try_acquire_lock(
        &self,
        site_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> Result<bool>;

    async fn release_lock(&self, site_id: &str, run_id: &str) -> Result<()>;

    /// Move the lock's timestamp to `now` if `run_id` still holds it.
    /// Returns `false` once another run has taken the lock over.
    async fn refresh_lock(&self, site_id: &str, run_id: &str, now: DateTime<Utc>) -> Result<bool>;

    async fn fingerprints(&self, keys: &[NaturalKey]) -> Result<HashMap<NaturalKey, Fingerprint>>;

    /// Atomic insert-or-update keyed by the natural key.
    ///
    /// With `embedding = None` the stored vector survives only when it was
    /// computed from the incoming `text_hash`; otherwise it is cleared and
    /// the object is left pending. `updated_at` moves to `now` only when the
    /// record hash changed or the row was inactive.
    async fn upsert_object(
        &self,
        obj: &ContentObject,
        embedding: Option<NewEmbedding<'_>>,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Soft-delete every active object of `site_id` not stamped by `run_id`.
    async fn deactivate_unseen(&self, site_id: &str, run_id: &str) -> Result<u64>;

    async fn pending_embeddings(&self, model: &str, limit: usize) -> Result<Vec<PendingEmbedding>>;

    /// Store a vector unless the object's text changed since it was read.
    async fn set_embedding(&self, id: i64, text_hash: &str, vector: &[f32], model: &str)
        -> Result<bool>;

    async fn clear_embeddings(&self) -> Result<u64>;
}

#[async_trait]
pub trait RetrievalStore: Send + Sync {
    /// Full-text candidates for an FTS5 MATCH expression, best first.
    async fn lexical_search(
        &self,
        fts_query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<Candidate>>;

    /// Current vector generation; changes whenever a vector or an activity
    /// flag changes.
    async fn vector_generation(&self) -> Result<i64>;

    async fn load_vectors(&self, model: &str) -> Result<VectorSnapshot>;

    /// Active objects among `ids` that pass `filters`.
    async fn hydrate(&self, ids: &[i64], filters: &SearchFilters) -> Result<HashMap<i64, ObjectRef>>;

    async fn get_object(&self, key: &NaturalKey) -> Result<Option<(i64, ContentObject)>>;
}

/// SQLite implementation of [`IndexStore`] and [`RetrievalStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect, migrate and verify the dimension pin against `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = Self::open_unpinned(config).await?;
        store.check_dims(config.embedding.dims).await?;
        Ok(store)
    }

    /// Connect and migrate without touching the dimension pin. Callers must
    /// run [`SqliteStore::check_dims`] before writing vectors.
    pub async fn open_unpinned(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO index_meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fail with [`FinderError::DimensionMismatch`] when stored vectors were
    /// produced at a different dimension. An index without vectors is
    /// re-pinned silently.
    pub async fn check_dims(&self, dims: usize) -> Result<()> {
        if let Some(recorded) = self.meta("embedding_dims").await? {
            let recorded: usize = recorded
                .parse()
                .with_context(|| format!("corrupt embedding_dims pin: '{}'", recorded))?;
            if recorded != dims {
                let embedded: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE embedding IS NOT NULL")
                        .fetch_one(&self.pool)
                        .await?;
                if embedded > 0 {
                    return Err(FinderError::DimensionMismatch {
                        expected: recorded,
                        actual: dims,
                    }
                    .into());
                }
            }
        }
        self.set_meta("embedding_dims", &dims.to_string()).await
    }

    /// Record the model that produces new vectors.
    pub async fn record_model(&self, model: &str) -> Result<()> {
        if let Some(previous) = self.meta("embedding_model").await? {
            if previous != model {
                tracing::warn!(
                    previous = %previous,
                    current = %model,
                    "embedding model changed; run `finder embed pending` to refresh stored vectors"
                );
            }
        }
        self.set_meta("embedding_model", model).await
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_ref(row: &SqliteRow) -> Result<ObjectRef> {
    let object_type: String = row.try_get("object_type")?;
    Ok(ObjectRef {
        site_id: row.try_get("site_id")?,
        object_type: object_type.parse::<ObjectType>()?,
        object_id: row.try_get("object_id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        project_name: row.try_get("project_name")?,
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

/// SQL fragment applying [`SearchFilters`] to alias `o`, binding `?2..?4`.
const FILTER_SQL: &str = "o.is_active = 1
    AND (?2 IS NULL OR o.site_id = ?2)
    AND (?3 IS NULL OR o.object_type = ?3)
    AND (?4 IS NULL OR instr(lower(o.project_name), lower(?4)) > 0)";

#[async_trait]
impl IndexStore for SqliteStore {
    async fn try_acquire_lock(
        &self,
        site_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> Result<bool> {
        let now_ms = to_millis(now);
        let result = sqlx::query(
            r#"
            INSERT INTO ingest_locks (site_id, run_id, acquired_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(site_id) DO UPDATE SET
                run_id = excluded.run_id,
                acquired_at = excluded.acquired_at
            WHERE ingest_locks.acquired_at < ?4
            "#,
        )
        .bind(site_id)
        .bind(run_id)
        .bind(now_ms)
        .bind(now_ms - ttl_secs.saturating_mul(1000))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, site_id: &str, run_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM ingest_locks WHERE site_id = ? AND run_id = ?")
            .bind(site_id)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn refresh_lock(&self, site_id: &str, run_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result =
            sqlx::query("UPDATE ingest_locks SET acquired_at = ? WHERE site_id = ? AND run_id = ?")
                .bind(to_millis(now))
                .bind(site_id)
                .bind(run_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fingerprints(&self, keys: &[NaturalKey]) -> Result<HashMap<NaturalKey, Fingerprint>> {
        let mut out = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(out);
        }

        // One read transaction so the batch sees a single snapshot.
        let mut tx = self.pool.begin().await?;
        for key in keys {
            let row = sqlx::query(
                "SELECT text_hash, record_hash, embedding_hash, embedding_model, is_active
                 FROM objects WHERE site_id = ? AND object_type = ? AND object_id = ?",
            )
            .bind(&key.site_id)
            .bind(key.object_type.as_str())
            .bind(&key.object_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = row {
                out.insert(
                    key.clone(),
                    Fingerprint {
                        text_hash: row.try_get("text_hash")?,
                        record_hash: row.try_get("record_hash")?,
                        embedding_hash: row.try_get("embedding_hash")?,
                        embedding_model: row.try_get("embedding_model")?,
                        is_active: row.try_get::<i64, _>("is_active")? != 0,
                    },
                );
            }
        }
        tx.commit().await?;

        Ok(out)
    }

    async fn upsert_object(
        &self,
        obj: &ContentObject,
        embedding: Option<NewEmbedding<'_>>,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tags_json = serde_json::to_string(&obj.tags)?;
        let fields_json = serde_json::to_string(&obj.fields)?;
        let blob = embedding.map(|e| vec_to_blob(e.vector));
        let model = embedding.map(|e| e.model);
        let embedding_hash = embedding.map(|_| obj.text_hash.as_str());

        sqlx::query(
            r#"
            INSERT INTO objects (site_id, object_type, object_id, title, description,
                                 tags_json, fields_json, project_name, owner, url,
                                 text_blob, text_hash, record_hash,
                                 embedding, embedding_model, embedding_hash,
                                 updated_at, last_seen_run, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT(site_id, object_type, object_id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                tags_json = excluded.tags_json,
                fields_json = excluded.fields_json,
                project_name = excluded.project_name,
                owner = excluded.owner,
                url = excluded.url,
                text_blob = excluded.text_blob,
                text_hash = excluded.text_hash,
                record_hash = excluded.record_hash,
                embedding = CASE
                    WHEN excluded.embedding IS NOT NULL THEN excluded.embedding
                    WHEN objects.embedding_hash = excluded.text_hash THEN objects.embedding
                    ELSE NULL END,
                embedding_model = CASE
                    WHEN excluded.embedding IS NOT NULL THEN excluded.embedding_model
                    WHEN objects.embedding_hash = excluded.text_hash THEN objects.embedding_model
                    ELSE NULL END,
                embedding_hash = CASE
                    WHEN excluded.embedding IS NOT NULL THEN excluded.embedding_hash
                    WHEN objects.embedding_hash = excluded.text_hash THEN objects.embedding_hash
                    ELSE NULL END,
                updated_at = CASE
                    WHEN objects.record_hash <> excluded.record_hash OR objects.is_active = 0
                    THEN excluded.updated_at
                    ELSE objects.updated_at END,
                last_seen_run = excluded.last_seen_run,
                is_active = 1
            "#,
        )
        .bind(&obj.site_id)
        .bind(obj.object_type.as_str())
        .bind(&obj.object_id)
        .bind(&obj.title)
        .bind(&obj.description)
        .bind(&tags_json)
        .bind(&fields_json)
        .bind(&obj.project_name)
        .bind(&obj.owner)
        .bind(&obj.url)
        .bind(&obj.text_blob)
        .bind(&obj.text_hash)
        .bind(&obj.record_hash)
        .bind(&blob)
        .bind(model)
        .bind(embedding_hash)
        .bind(to_millis(now))
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn deactivate_unseen(&self, site_id: &str, run_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE objects SET is_active = 0
             WHERE site_id = ? AND is_active = 1
               AND (last_seen_run IS NULL OR last_seen_run <> ?)",
        )
        .bind(site_id)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn pending_embeddings(&self, model: &str, limit: usize) -> Result<Vec<PendingEmbedding>> {
        let rows = sqlx::query(
            "SELECT id, text_blob, text_hash FROM objects
             WHERE is_active = 1
               AND (embedding IS NULL
                    OR embedding_model IS NOT ?
                    OR embedding_hash IS NOT text_hash)
             ORDER BY id
             LIMIT ?",
        )
        .bind(model)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PendingEmbedding {
                    id: row.try_get("id")?,
                    text_blob: row.try_get("text_blob")?,
                    text_hash: row.try_get("text_hash")?,
                })
            })
            .collect()
    }

    async fn set_embedding(
        &self,
        id: i64,
        text_hash: &str,
        vector: &[f32],
        model: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE objects SET embedding = ?, embedding_model = ?, embedding_hash = text_hash
             WHERE id = ? AND text_hash = ?",
        )
        .bind(vec_to_blob(vector))
        .bind(model)
        .bind(id)
        .bind(text_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_embeddings(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE objects SET embedding = NULL, embedding_model = NULL, embedding_hash = NULL
             WHERE embedding IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RetrievalStore for SqliteStore {
    async fn lexical_search(
        &self,
        fts_query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let sql = format!(
            r#"
            SELECT o.id, o.site_id, o.object_type, o.object_id, o.title, o.url,
                   o.project_name, o.updated_at,
                   bm25(objects_fts, 4.0, 1.0, 2.0, 1.0) AS score
            FROM objects_fts
            JOIN objects o ON o.id = objects_fts.rowid
            WHERE objects_fts MATCH ?1 AND {}
            ORDER BY score, o.id
            LIMIT ?5
            "#,
            FILTER_SQL
        );

        let rows = sqlx::query(&sql)
            .bind(fts_query)
            .bind(filters.site_id.as_deref())
            .bind(filters.object_type.map(|t| t.as_str()))
            .bind(filters.project_name.as_deref())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let bm25: f64 = row.try_get("score")?;
                Ok(Candidate {
                    id: row.try_get("id")?,
                    object: row_to_ref(row)?,
                    raw_score: -bm25,
                })
            })
            .collect()
    }

    async fn vector_generation(&self) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT CAST(value AS INTEGER) FROM index_meta WHERE key = 'generation'",
        )
        .fetch_one(&self.pool)
        .await?)
    }

    async fn load_vectors(&self, model: &str) -> Result<VectorSnapshot> {
        let mut tx = self.pool.begin().await?;

        let generation: i64 = sqlx::query_scalar(
            "SELECT CAST(value AS INTEGER) FROM index_meta WHERE key = 'generation'",
        )
        .fetch_one(&mut *tx)
        .await?;

        let rows = sqlx::query(
            "SELECT id, embedding FROM objects
             WHERE is_active = 1 AND embedding IS NOT NULL AND embedding_model = ?
             ORDER BY id",
        )
        .bind(model)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut snapshot = VectorSnapshot {
            generation,
            ids: Vec::with_capacity(rows.len()),
            vectors: Vec::with_capacity(rows.len()),
        };
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            snapshot.ids.push(row.try_get("id")?);
            snapshot.vectors.push(blob_to_vec(&blob));
        }
        Ok(snapshot)
    }

    async fn hydrate(&self, ids: &[i64], filters: &SearchFilters) -> Result<HashMap<i64, ObjectRef>> {
        let mut out = HashMap::with_capacity(ids.len());
        if ids.is_empty() {
            return Ok(out);
        }

        // ?1 carries the id list as JSON so the statement text stays fixed.
        let id_list = serde_json::to_string(ids)?;
        let sql = format!(
            r#"
            SELECT o.id, o.site_id, o.object_type, o.object_id, o.title, o.url,
                   o.project_name, o.updated_at
            FROM objects o
            WHERE o.id IN (SELECT value FROM json_each(?1)) AND {}
            "#,
            FILTER_SQL
        );

        let rows = sqlx::query(&sql)
            .bind(id_list)
            .bind(filters.site_id.as_deref())
            .bind(filters.object_type.map(|t| t.as_str()))
            .bind(filters.project_name.as_deref())
            .fetch_all(&self.pool)
            .await?;

        for row in &rows {
            out.insert(row.try_get("id")?, row_to_ref(row)?);
        }
        Ok(out)
    }

    async fn get_object(&self, key: &NaturalKey) -> Result<Option<(i64, ContentObject)>> {
        let row = sqlx::query(
            "SELECT * FROM objects WHERE site_id = ? AND object_type = ? AND object_id = ?",
        )
        .bind(&key.site_id)
        .bind(key.object_type.as_str())
        .bind(&key.object_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let tags_json: String = row.try_get("tags_json")?;
        let fields_json: String = row.try_get("fields_json")?;
        let object_type: String = row.try_get("object_type")?;
        let embedding: Option<Vec<u8>> = row.try_get("embedding")?;

        let obj = ContentObject {
            site_id: row.try_get("site_id")?,
            object_type: object_type.parse()?,
            object_id: row.try_get("object_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            tags: serde_json::from_str::<BTreeSet<String>>(&tags_json)?,
            fields: serde_json::from_str(&fields_json)?,
            project_name: row.try_get("project_name")?,
            owner: row.try_get("owner")?,
            url: row.try_get("url")?,
            text_blob: row.try_get("text_blob")?,
            text_hash: row.try_get("text_hash")?,
            record_hash: row.try_get("record_hash")?,
            embedding: embedding.map(|b| blob_to_vec(&b)),
            updated_at: Some(from_millis(row.try_get("updated_at")?)),
            is_active: row.try_get::<i64, _>("is_active")? != 0,
        };

        Ok(Some((row.try_get("id")?, obj)))
    }
}

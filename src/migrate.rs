//! Idempotent schema setup.
//!
//! Tables:
//! - `objects`: one row per natural key `(site_id, object_type, object_id)`,
//!   text attributes, the embedding BLOB and soft-delete bookkeeping.
//! - `objects_fts`: FTS5 external-content index over title, text_blob,
//!   project and owner, maintained by triggers.
//! - `index_meta`: key/value pairs holding the vector `generation` (bumped by trigger
//!   whenever a vector or activity flag changes) and the pinned embedding
//!   model and dimension.
//! - `ingest_locks`: one advisory writer lock per site.

use anyhow::Result;
use sqlx::SqlitePool;

const OBJECTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS objects (
        id INTEGER PRIMARY KEY,
        site_id TEXT NOT NULL,
        object_type TEXT NOT NULL,
        object_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        tags_json TEXT NOT NULL DEFAULT '[]',
        fields_json TEXT NOT NULL DEFAULT '[]',
        project_name TEXT NOT NULL DEFAULT '',
        owner TEXT NOT NULL DEFAULT '',
        url TEXT NOT NULL DEFAULT '',
        text_blob TEXT NOT NULL,
        text_hash TEXT NOT NULL,
        record_hash TEXT NOT NULL,
        embedding BLOB,
        embedding_model TEXT,
        embedding_hash TEXT,
        updated_at INTEGER NOT NULL,
        last_seen_run TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        UNIQUE(site_id, object_type, object_id)
    )
"#;

const SCHEMA: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_objects_site_active ON objects(site_id, is_active)",
    "CREATE INDEX IF NOT EXISTS idx_objects_updated_at ON objects(updated_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS index_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    "INSERT OR IGNORE INTO index_meta (key, value) VALUES ('generation', '0')",
    r#"
    CREATE TABLE IF NOT EXISTS ingest_locks (
        site_id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL,
        acquired_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS objects_fts_ai AFTER INSERT ON objects BEGIN
        INSERT INTO objects_fts (rowid, title, text_blob, project_name, owner)
        VALUES (new.id, new.title, new.text_blob, new.project_name, new.owner);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS objects_fts_ad AFTER DELETE ON objects BEGIN
        INSERT INTO objects_fts (objects_fts, rowid, title, text_blob, project_name, owner)
        VALUES ('delete', old.id, old.title, old.text_blob, old.project_name, old.owner);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS objects_fts_au
    AFTER UPDATE OF title, text_blob, project_name, owner ON objects BEGIN
        INSERT INTO objects_fts (objects_fts, rowid, title, text_blob, project_name, owner)
        VALUES ('delete', old.id, old.title, old.text_blob, old.project_name, old.owner);
        INSERT INTO objects_fts (rowid, title, text_blob, project_name, owner)
        VALUES (new.id, new.title, new.text_blob, new.project_name, new.owner);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS objects_gen_ai AFTER INSERT ON objects
    WHEN new.embedding IS NOT NULL BEGIN
        UPDATE index_meta SET value = CAST(value AS INTEGER) + 1 WHERE key = 'generation';
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS objects_gen_au AFTER UPDATE OF embedding, is_active ON objects
    WHEN old.embedding IS NOT new.embedding OR old.is_active IS NOT new.is_active BEGIN
        UPDATE index_meta SET value = CAST(value AS INTEGER) + 1 WHERE key = 'generation';
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS objects_gen_ad AFTER DELETE ON objects
    WHEN old.embedding IS NOT NULL BEGIN
        UPDATE index_meta SET value = CAST(value AS INTEGER) + 1 WHERE key = 'generation';
    END
    "#,
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='objects_fts'",
    )
    .fetch_one(pool)
    .await?;

    let mut tx = pool.begin().await?;

    // content table before the index, index before the triggers
    sqlx::query(OBJECTS_TABLE).execute(&mut *tx).await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE objects_fts USING fts5(
                title,
                text_blob,
                project_name,
                owner,
                content='objects',
                content_rowid='id'
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
    }

    for stmt in SCHEMA {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

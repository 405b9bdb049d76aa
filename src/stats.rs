//! Index statistics and health overview.
//!
//! A quick summary of what's indexed: object counts per type, soft-deleted
//! rows, embedding coverage for the configured model, and the recorded model
//! and dimension pin. Used by `finder stats` and `GET /stats`.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::models::ObjectType;
use crate::store::{from_millis, RetrievalStore, SqliteStore};

#[derive(Debug, Clone, Serialize)]
pub struct TypeStats {
    pub object_type: ObjectType,
    pub active: i64,
    pub inactive: i64,
    /// Active objects with a current vector from the configured model.
    pub embedded: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub active: i64,
    pub inactive: i64,
    pub embedded: i64,
    pub by_type: Vec<TypeStats>,
    pub configured_model: String,
    pub recorded_model: Option<String>,
    pub dims: Option<usize>,
    pub generation: i64,
    /// Most recent `updated_at`, epoch milliseconds.
    pub last_updated_ms: Option<i64>,
}

impl IndexStats {
    /// Percentage of active objects with a current vector.
    pub fn coverage_percent(&self) -> i64 {
        if self.active > 0 {
            (self.embedded * 100) / self.active
        } else {
            0
        }
    }
}

pub async fn collect_stats(store: &SqliteStore, configured_model: &str) -> Result<IndexStats> {
    let rows = sqlx::query(
        r#"
        SELECT object_type,
               SUM(CASE WHEN is_active = 1 THEN 1 ELSE 0 END) AS active,
               SUM(CASE WHEN is_active = 0 THEN 1 ELSE 0 END) AS inactive,
               SUM(CASE WHEN is_active = 1
                         AND embedding IS NOT NULL
                         AND embedding_model = ?
                         AND embedding_hash = text_hash THEN 1 ELSE 0 END) AS embedded
        FROM objects
        GROUP BY object_type
        "#,
    )
    .bind(configured_model)
    .fetch_all(store.pool())
    .await?;

    let mut by_type = Vec::new();
    for object_type in ObjectType::ALL {
        let row = rows.iter().find(|r| {
            r.try_get::<String, _>("object_type")
                .map(|t| t == object_type.as_str())
                .unwrap_or(false)
        });
        let (active, inactive, embedded) = match row {
            Some(r) => (
                r.try_get("active")?,
                r.try_get("inactive")?,
                r.try_get("embedded")?,
            ),
            None => (0, 0, 0),
        };
        by_type.push(TypeStats {
            object_type,
            active,
            inactive,
            embedded,
        });
    }

    let last_updated_ms: Option<i64> = sqlx::query_scalar("SELECT MAX(updated_at) FROM objects")
        .fetch_one(store.pool())
        .await?;

    Ok(IndexStats {
        active: by_type.iter().map(|t| t.active).sum(),
        inactive: by_type.iter().map(|t| t.inactive).sum(),
        embedded: by_type.iter().map(|t| t.embedded).sum(),
        by_type,
        configured_model: configured_model.to_string(),
        recorded_model: store.meta("embedding_model").await?,
        dims: store
            .meta("embedding_dims")
            .await?
            .and_then(|d| d.parse().ok()),
        generation: store.vector_generation().await?,
        last_updated_ms,
    })
}

/// Run the stats command: query the index and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let embedder = Embedder::from_config(&config.embedding)?;
    let stats = collect_stats(&store, embedder.model_name()).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Content Finder: Index Stats");
    println!("============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Model:       {} ({} dims)",
        stats.configured_model,
        stats
            .dims
            .map(|d| d.to_string())
            .unwrap_or_else(|| "?".to_string())
    );
    if let Some(recorded) = &stats.recorded_model {
        if recorded != &stats.configured_model {
            println!("  Recorded:    {} (run `finder embed pending`)", recorded);
        }
    }
    println!();
    println!("  Active:      {}", stats.active);
    println!("  Inactive:    {}", stats.inactive);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.embedded,
        stats.active,
        stats.coverage_percent()
    );
    println!(
        "  Updated:     {}",
        stats
            .last_updated_ms
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );

    println!();
    println!("  By type:");
    println!(
        "  {:<12} {:>8} {:>9} {:>9}",
        "TYPE", "ACTIVE", "INACTIVE", "EMBEDDED"
    );
    println!("  {}", "-".repeat(41));
    for t in &stats.by_type {
        println!(
            "  {:<12} {:>8} {:>9} {:>9}",
            t.object_type, t.active, t.inactive, t.embedded
        );
    }
    println!();

    store.pool().close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative time ("3 hours ago") for an epoch-millisecond timestamp.
fn format_ts_relative(ms: i64) -> String {
    let then = from_millis(ms);
    let delta = (chrono::Utc::now() - then).num_seconds();

    if delta < 0 {
        then.format("%Y-%m-%d %H:%M").to_string()
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        then.format("%Y-%m-%d %H:%M").to_string()
    }
}

//! Embedding backfill: `finder embed pending` and `finder embed rebuild`.
//!
//! Pending objects are active rows with no vector, a vector from another
//! model, or a vector computed from older text. Vectors are written with a
//! text-hash guard, so an object re-ingested with new text while the backfill
//! ran is left pending instead of receiving a stale vector.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::store::{IndexStore, SqliteStore};

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub pending: usize,
    pub embedded: usize,
    pub failed: usize,
    /// Vectors dropped because the object's text changed mid-backfill.
    pub superseded: usize,
}

/// Embed up to `limit` pending objects.
pub async fn backfill(
    store: &dyn IndexStore,
    embedder: &Embedder,
    limit: Option<usize>,
) -> Result<BackfillReport> {
    let limit = limit.unwrap_or(i64::MAX as usize);
    let pending = store.pending_embeddings(embedder.model_name(), limit).await?;

    let mut report = BackfillReport {
        pending: pending.len(),
        ..Default::default()
    };
    if pending.is_empty() {
        return Ok(report);
    }

    let texts: Vec<String> = pending.iter().map(|p| p.text_blob.clone()).collect();
    let vectors = embedder.embed_all(&texts).await?;

    for (item, vector) in pending.iter().zip(vectors) {
        let Some(vector) = vector else {
            report.failed += 1;
            continue;
        };
        if store
            .set_embedding(item.id, &item.text_hash, &vector, embedder.model_name())
            .await?
        {
            report.embedded += 1;
        } else {
            report.superseded += 1;
        }
    }

    tracing::info!(
        pending = report.pending,
        embedded = report.embedded,
        failed = report.failed,
        superseded = report.superseded,
        "embedding backfill finished"
    );
    Ok(report)
}

pub async fn run_embed_pending(config: &Config, limit: Option<usize>, dry_run: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let embedder = Embedder::from_config(&config.embedding)?;

    if dry_run {
        let pending = store
            .pending_embeddings(embedder.model_name(), limit.unwrap_or(i64::MAX as usize))
            .await?;
        println!("embed pending (dry-run)");
        println!("  objects needing embeddings: {}", pending.len());
        store.pool().close().await;
        return Ok(());
    }

    let report = backfill(&store, &embedder, limit).await?;
    if report.embedded > 0 {
        store.record_model(embedder.model_name()).await?;
    }

    println!("embed pending");
    if report.pending == 0 {
        println!("  all objects up to date");
    } else {
        print_report(&report);
    }

    store.pool().close().await;
    Ok(())
}

/// Drop every stored vector, re-pin the index to the embedder's dimension
/// and embed all active objects again. Returns the number of vectors cleared.
///
/// Clearing comes first so a dimension change recorded by an earlier model
/// does not block the rebuild.
pub async fn rebuild(store: &SqliteStore, embedder: &Embedder) -> Result<(u64, BackfillReport)> {
    let cleared = store.clear_embeddings().await?;
    store.check_dims(embedder.dims()).await?;
    let report = backfill(store, embedder, None).await?;
    store.record_model(embedder.model_name()).await?;
    Ok((cleared, report))
}

pub async fn run_embed_rebuild(config: &Config) -> Result<()> {
    let store = SqliteStore::open_unpinned(config).await?;
    let embedder = Embedder::from_config(&config.embedding)?;

    let (cleared, report) = rebuild(&store, &embedder).await?;
    println!("embed rebuild");
    println!("  cleared: {}", cleared);
    print_report(&report);

    store.pool().close().await;
    Ok(())
}

fn print_report(report: &BackfillReport) {
    println!("  total pending: {}", report.pending);
    println!("  embedded: {}", report.embedded);
    println!("  failed: {}", report.failed);
    if report.superseded > 0 {
        println!("  superseded: {}", report.superseded);
    }
}

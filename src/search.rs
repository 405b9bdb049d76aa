//! CLI front ends for retrieval: `finder search`, `finder similar` and
//! `finder ask`.
//!
//! These print plain text to stdout. Retrieval itself lives in
//! [`crate::planner`] and [`crate::conversation`].

use anyhow::{Context, Result};
use std::path::Path;

use crate::app::App;
use crate::config::Config;
use crate::models::{
    ConversationTurn, NaturalKey, ObjectType, QueryRequest, QueryStatus, SearchFilters,
    SearchResult,
};

pub async fn run_search(
    config: &Config,
    query: &str,
    filters: SearchFilters,
    top_k: Option<usize>,
    explain: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let app = App::open(config).await?;
    let top_k = top_k.unwrap_or(config.retrieval.top_k).max(1);
    let outcome = app.planner.search(query, None, &filters, top_k).await;

    if outcome.unavailable() {
        println!("No results are available right now: the index could not be reached.");
    } else if outcome.results.is_empty() {
        println!("No results.");
    } else {
        print_results(&outcome.results, explain);
    }

    if explain {
        let weights = app.planner.weights();
        println!(
            "candidates: lexical={} semantic={}  weights: lexical={:.2} semantic={:.2}",
            outcome.lexical_candidates, outcome.semantic_candidates, weights.lexical, weights.semantic
        );
    }
    for path in &outcome.degraded {
        eprintln!("Warning: {} retrieval degraded", path);
    }

    app.close().await;
    Ok(())
}

pub async fn run_similar(
    config: &Config,
    object_type: ObjectType,
    object_id: &str,
    site: Option<String>,
    limit: usize,
) -> Result<()> {
    let app = App::open(config).await?;

    let site_id = match site {
        Some(site) => site,
        None => sole_site(&app, object_type, object_id).await?,
    };
    let key = NaturalKey {
        site_id,
        object_type,
        object_id: object_id.to_string(),
    };

    let results = app.planner.similar(&key, limit.max(1)).await?;
    if results.is_empty() {
        println!("No similar objects.");
    } else {
        print_results(&results, false);
    }

    app.close().await;
    Ok(())
}

/// The site holding `type/id` when `--site` was not given; ambiguous ids
/// are an error.
async fn sole_site(app: &App, object_type: ObjectType, object_id: &str) -> Result<String> {
    let sites: Vec<String> = sqlx::query_scalar(
        "SELECT site_id FROM objects WHERE object_type = ? AND object_id = ? ORDER BY site_id",
    )
    .bind(object_type.as_str())
    .bind(object_id)
    .fetch_all(app.store.pool())
    .await?;

    match sites.as_slice() {
        [] => anyhow::bail!("No {} with id '{}'", object_type, object_id),
        [one] => Ok(one.clone()),
        many => anyhow::bail!(
            "{} '{}' exists on several sites ({}); pass --site",
            object_type,
            object_id,
            many.join(", ")
        ),
    }
}

pub async fn run_ask(config: &Config, query: &str, history_path: Option<&Path>) -> Result<()> {
    let conversation_history: Vec<ConversationTurn> = match history_path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read history file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid history JSON in {}", path.display()))?
        }
        None => Vec::new(),
    };

    let app = App::open(config).await?;
    let request = QueryRequest {
        query: query.to_string(),
        conversation_history,
        top_k: None,
        filters: SearchFilters::default(),
    };
    let response = app.conversation.ask(&request).await;

    println!("{}", response.answer);
    for name in &response.degraded {
        eprintln!("Warning: {} degraded", name);
    }

    if let Some(path) = history_path {
        if response.status != QueryStatus::Unavailable {
            let json = serde_json::to_string_pretty(&response.conversation_history)?;
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write history file: {}", path.display()))?;
        }
    }

    app.close().await;
    Ok(())
}

fn print_results(results: &[SearchResult], explain: bool) {
    for r in results {
        let o = &r.object;
        println!(
            "{}. [{:.2}] {} / {}",
            r.rank, r.fused_score, o.object_type, o.title
        );
        println!("    updated: {}", o.updated_at.format("%Y-%m-%d"));
        if !o.project_name.is_empty() {
            println!("    project: {}", o.project_name);
        }
        if !o.url.is_empty() {
            println!("    url: {}", o.url);
        }
        if explain {
            println!(
                "    scores: lexical={:.3} semantic={:.3}",
                r.lexical_score, r.semantic_score
            );
        }
        println!("    key: {}", o.key());
        println!();
    }
}

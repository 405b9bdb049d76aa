//! Hybrid query planning: lexical and semantic candidates, fetched
//! concurrently, then fused.
//!
//! # Lexical path
//!
//! The query is split into alphanumeric terms, stop words are dropped and
//! each remaining term is quoted and OR-joined into an FTS5 `MATCH`
//! expression. Ranking is bm25 weighted title 4, text 1, project 2, owner 1.
//!
//! # Semantic path
//!
//! The query text is embedded with the shared [`Embedder`] and compared
//! against a [`VectorIndex`] built from the store's current vector snapshot.
//! The index is cached and rebuilt only when the store's vector generation
//! moves. Matches below `min_semantic_similarity` are dropped.
//!
//! # Degradation
//!
//! Each path runs under the query timeout with one retry. A path that still
//! fails is reported in [`PlannedCandidates::degraded`] and contributes no
//! candidates; the other path is fused alone.

use anyhow::{bail, Result};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::FinderError;
use crate::fusion::{fuse, FusionWeights};
use crate::models::{NaturalKey, RetrievalPath, SearchFilters, SearchResult};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{Candidate, RetrievalStore};
use crate::vector_index::VectorIndex;

/// Words that carry no signal in "where can I find …" questions.
pub const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "reports", "data", "show", "me", "find", "get", "about", "what", "is",
];

/// Build an FTS5 MATCH expression, or `None` when nothing searchable is left.
pub fn build_fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .map(|t| format!("\"{}\"", t))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlannedCandidates {
    pub lexical: Vec<Candidate>,
    pub semantic: Vec<Candidate>,
    pub degraded: Vec<RetrievalPath>,
}

impl PlannedCandidates {
    /// Neither path could be reached.
    pub fn unavailable(&self) -> bool {
        self.degraded.contains(&RetrievalPath::Lexical)
            && self.degraded.contains(&RetrievalPath::Semantic)
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub degraded: Vec<RetrievalPath>,
    pub lexical_candidates: usize,
    pub semantic_candidates: usize,
}

impl SearchOutcome {
    pub fn unavailable(&self) -> bool {
        self.degraded.len() == 2
    }
}

pub struct HybridPlanner {
    store: Arc<dyn RetrievalStore>,
    embedder: Arc<Embedder>,
    weights: FusionWeights,
    candidate_k_lexical: usize,
    candidate_k_semantic: usize,
    min_similarity: f32,
    ann_min_vectors: usize,
    policy: RetryPolicy,
    index: RwLock<Option<Arc<VectorIndex>>>,
}

impl HybridPlanner {
    pub fn new(
        store: Arc<dyn RetrievalStore>,
        embedder: Arc<Embedder>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            weights: FusionWeights::new(config.lexical_weight, config.semantic_weight),
            candidate_k_lexical: config.candidate_k_lexical,
            candidate_k_semantic: config.candidate_k_semantic,
            min_similarity: config.min_semantic_similarity as f32,
            ann_min_vectors: config.ann_min_vectors,
            policy: RetryPolicy::new(1, config.query_timeout())
                .with_base_delay(Duration::from_millis(250)),
            index: RwLock::new(None),
        }
    }

    pub fn with_backoff(mut self, base_delay: Duration) -> Self {
        self.policy = self.policy.with_base_delay(base_delay);
        self
    }

    pub fn weights(&self) -> FusionWeights {
        self.weights
    }

    /// Run both paths concurrently.
    pub async fn plan(
        &self,
        lexical_query: &str,
        semantic_text: &str,
        filters: &SearchFilters,
    ) -> PlannedCandidates {
        let (lexical, semantic) = tokio::join!(
            with_retry("lexical search", &self.policy, || self
                .lexical(lexical_query, filters)),
            with_retry("semantic search", &self.policy, || self
                .semantic(semantic_text, filters)),
        );

        let mut planned = PlannedCandidates::default();
        match lexical {
            Ok(c) => planned.lexical = c,
            Err(e) => {
                let err = FinderError::Query {
                    path: RetrievalPath::Lexical.to_string(),
                    reason: format!("{:#}", e),
                };
                tracing::warn!(error = %err, "retrieval path degraded");
                planned.degraded.push(RetrievalPath::Lexical);
            }
        }
        match semantic {
            Ok(c) => planned.semantic = c,
            Err(e) => {
                let err = FinderError::Query {
                    path: RetrievalPath::Semantic.to_string(),
                    reason: format!("{:#}", e),
                };
                tracing::warn!(error = %err, "retrieval path degraded");
                planned.degraded.push(RetrievalPath::Semantic);
            }
        }

        tracing::debug!(
            lexical = planned.lexical.len(),
            semantic = planned.semantic.len(),
            degraded = planned.degraded.len(),
            "candidates planned"
        );
        planned
    }

    /// Plan and fuse. `semantic_text` defaults to `query` when `None`.
    pub async fn search(
        &self,
        query: &str,
        semantic_text: Option<&str>,
        filters: &SearchFilters,
        top_k: usize,
    ) -> SearchOutcome {
        let planned = self
            .plan(query, semantic_text.unwrap_or(query), filters)
            .await;
        let results = fuse(&planned.lexical, &planned.semantic, self.weights, top_k);
        SearchOutcome {
            results,
            lexical_candidates: planned.lexical.len(),
            semantic_candidates: planned.semantic.len(),
            degraded: planned.degraded,
        }
    }

    async fn lexical(&self, query: &str, filters: &SearchFilters) -> Result<Vec<Candidate>> {
        let Some(fts_query) = build_fts_query(query) else {
            return Ok(Vec::new());
        };
        self.store
            .lexical_search(&fts_query, filters, self.candidate_k_lexical)
            .await
    }

    async fn semantic(&self, text: &str, filters: &SearchFilters) -> Result<Vec<Candidate>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let index = self.vector_index().await?;
        if index.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = self.embedder.embed_query(text).await?;

        let filtered = filters.site_id.is_some()
            || filters.object_type.is_some()
            || filters.project_name.is_some();
        let hits = if filtered {
            // filters are applied on hydration, so rank everything first
            index.search_exact(&query_vec, index.len(), self.min_similarity)
        } else {
            index.search(&query_vec, self.candidate_k_semantic, self.min_similarity)
        };

        let ids: Vec<i64> = hits.iter().map(|h| h.id).collect();
        let mut refs = self.store.hydrate(&ids, filters).await?;

        let candidates: Vec<Candidate> = hits
            .into_iter()
            .filter_map(|h| {
                refs.remove(&h.id).map(|object| Candidate {
                    id: h.id,
                    object,
                    raw_score: h.similarity as f64,
                })
            })
            .take(self.candidate_k_semantic)
            .collect();
        Ok(candidates)
    }

    /// The cached index, rebuilt when the store's vector generation moved.
    pub async fn vector_index(&self) -> Result<Arc<VectorIndex>> {
        let generation = self.store.vector_generation().await?;

        if let Some(cached) = self.cached_index() {
            if cached.generation() == generation {
                return Ok(cached);
            }
        }

        let snapshot = self.store.load_vectors(self.embedder.model_name()).await?;
        let ann_min_vectors = self.ann_min_vectors;
        let index = Arc::new(
            tokio::task::spawn_blocking(move || VectorIndex::build(snapshot, ann_min_vectors))
                .await?,
        );
        tracing::debug!(
            generation = index.generation(),
            vectors = index.len(),
            approximate = index.is_approximate(),
            "vector index rebuilt"
        );

        let mut slot = self.index.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::clone(&index));
        Ok(index)
    }

    fn cached_index(&self) -> Option<Arc<VectorIndex>> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Arc::clone)
    }

    /// Nearest neighbours of a stored object's own embedding.
    pub async fn similar(&self, key: &NaturalKey, limit: usize) -> Result<Vec<SearchResult>> {
        let Some((id, obj)) = self.store.get_object(key).await? else {
            bail!("No object found for {}", key);
        };
        let Some(vector) = obj.embedding else {
            bail!(
                "{} has no embedding yet; run `finder embed pending` first",
                key
            );
        };

        let index = self.vector_index().await?;
        let hits: Vec<_> = index
            .search_exact(&vector, limit + 1, self.min_similarity)
            .into_iter()
            .filter(|h| h.id != id)
            .take(limit)
            .collect();

        let ids: Vec<i64> = hits.iter().map(|h| h.id).collect();
        let mut refs = self.store.hydrate(&ids, &SearchFilters::default()).await?;

        Ok(hits
            .into_iter()
            .filter_map(|h| {
                refs.remove(&h.id).map(|object| (object, h.similarity as f64))
            })
            .enumerate()
            .map(|(i, (object, similarity))| SearchResult {
                object,
                lexical_score: 0.0,
                semantic_score: similarity,
                fused_score: similarity,
                rank: i + 1,
            })
            .collect())
    }
}

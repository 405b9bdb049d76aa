//! In-memory nearest-neighbour index over one [`VectorSnapshot`].
//!
//! Small sets are scanned exactly. With the `ann-hnsw` feature, sets of at
//! least `ann_min_vectors` vectors also get an HNSW graph (cosine distance)
//! used for unfiltered top-k queries. The index is immutable; the planner
//! rebuilds it when the store's vector generation moves.

#[cfg(feature = "ann-hnsw")]
use hnsw_rs::prelude::{DistCosine, Hnsw, Neighbour};

use crate::embedding::cosine_similarity;
use crate::store::VectorSnapshot;

#[cfg(feature = "ann-hnsw")]
const HNSW_M: usize = 16;
#[cfg(feature = "ann-hnsw")]
const HNSW_EF_CONSTRUCTION: usize = 200;
#[cfg(feature = "ann-hnsw")]
const HNSW_MAX_LAYER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorHit {
    pub id: i64,
    pub similarity: f32,
}

pub struct VectorIndex {
    generation: i64,
    ids: Vec<i64>,
    vectors: Vec<Vec<f32>>,
    #[cfg(feature = "ann-hnsw")]
    ann: Option<Hnsw<'static, f32, DistCosine>>,
}

impl VectorIndex {
    pub fn build(snapshot: VectorSnapshot, ann_min_vectors: usize) -> Self {
        let VectorSnapshot {
            generation,
            ids,
            vectors,
        } = snapshot;

        #[cfg(feature = "ann-hnsw")]
        let ann = if !vectors.is_empty() && vectors.len() >= ann_min_vectors {
            tracing::info!(count = vectors.len(), "building HNSW index");
            let hnsw = Hnsw::new(
                HNSW_M,
                vectors.len(),
                HNSW_MAX_LAYER,
                HNSW_EF_CONSTRUCTION,
                DistCosine,
            );
            // zero vectors have no direction; DistCosine would put them at distance 0
            let with_ids: Vec<(&Vec<f32>, usize)> = vectors
                .iter()
                .enumerate()
                .filter(|(_, v)| v.iter().any(|x| *x != 0.0))
                .map(|(i, v)| (v, i))
                .collect();
            hnsw.parallel_insert(&with_ids);
            Some(hnsw)
        } else {
            None
        };
        #[cfg(not(feature = "ann-hnsw"))]
        let _ = ann_min_vectors;

        Self {
            generation,
            ids,
            vectors,
            #[cfg(feature = "ann-hnsw")]
            ann,
        }
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_approximate(&self) -> bool {
        #[cfg(feature = "ann-hnsw")]
        {
            self.ann.is_some()
        }
        #[cfg(not(feature = "ann-hnsw"))]
        {
            false
        }
    }

    /// Top `k` neighbours of `query` with similarity ≥ `min_similarity`,
    /// best first, ties broken by ascending id.
    pub fn search(&self, query: &[f32], k: usize, min_similarity: f32) -> Vec<VectorHit> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }

        #[cfg(feature = "ann-hnsw")]
        if let Some(ann) = &self.ann {
            let ef = (k * 2).max(64);
            let neighbours: Vec<Neighbour> = ann.search(query, k, ef);
            let mut hits: Vec<VectorHit> = neighbours
                .into_iter()
                .filter_map(|n| {
                    let id = *self.ids.get(n.d_id)?;
                    let similarity = cosine_similarity(query, self.vectors.get(n.d_id)?);
                    (similarity >= min_similarity).then_some(VectorHit { id, similarity })
                })
                .collect();
            sort_hits(&mut hits);
            return hits;
        }

        self.search_exact(query, k, min_similarity)
    }

    /// Exhaustive cosine scan.
    pub fn search_exact(&self, query: &[f32], k: usize, min_similarity: f32) -> Vec<VectorHit> {
        let mut hits: Vec<VectorHit> = self
            .ids
            .iter()
            .zip(&self.vectors)
            .map(|(&id, v)| VectorHit {
                id,
                similarity: cosine_similarity(query, v),
            })
            .filter(|h| h.similarity >= min_similarity)
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }
}

fn sort_hits(hits: &mut [VectorHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
}

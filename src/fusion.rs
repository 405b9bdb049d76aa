//! Score fusion: two ranked candidate lists in, one total order out.
//!
//! Each list is min-max normalised to `[0, 1]` on its own (a list whose
//! scores are all equal normalises to `1.0`). Candidates are merged by store
//! id and scored `w_lex · lex + w_sem · sem`, with a missing score counting
//! as `0.0`. When one list is empty the surviving score is used alone.
//!
//! Order: fused score desc, `updated_at` desc, title asc, natural key asc.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::SearchResult;
use crate::store::Candidate;

/// Path weights, renormalised to sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub lexical: f64,
    pub semantic: f64,
}

impl FusionWeights {
    pub fn new(lexical: f64, semantic: f64) -> Self {
        let lexical = lexical.max(0.0);
        let semantic = semantic.max(0.0);
        let sum = lexical + semantic;
        if sum <= f64::EPSILON {
            return Self::default();
        }
        Self {
            lexical: lexical / sum,
            semantic: semantic / sum,
        }
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            lexical: 0.5,
            semantic: 0.5,
        }
    }
}

/// Min-max normalise raw scores to `[0, 1]`.
pub fn normalize_scores(candidates: &[Candidate]) -> Vec<(&Candidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

struct Merged<'a> {
    candidate: &'a Candidate,
    lexical: f64,
    semantic: f64,
}

/// Fuse both lists and return the best `top_k`, ranked from 1.
pub fn fuse(
    lexical: &[Candidate],
    semantic: &[Candidate],
    weights: FusionWeights,
    top_k: usize,
) -> Vec<SearchResult> {
    let weights = match (lexical.is_empty(), semantic.is_empty()) {
        (true, true) => return Vec::new(),
        (false, true) => FusionWeights {
            lexical: 1.0,
            semantic: 0.0,
        },
        (true, false) => FusionWeights {
            lexical: 0.0,
            semantic: 1.0,
        },
        (false, false) => weights,
    };

    let mut merged: HashMap<i64, Merged<'_>> = HashMap::new();
    for (c, s) in normalize_scores(lexical) {
        merged
            .entry(c.id)
            .or_insert(Merged {
                candidate: c,
                lexical: 0.0,
                semantic: 0.0,
            })
            .lexical = s;
    }
    for (c, s) in normalize_scores(semantic) {
        merged
            .entry(c.id)
            .or_insert(Merged {
                candidate: c,
                lexical: 0.0,
                semantic: 0.0,
            })
            .semantic = s;
    }

    let mut results: Vec<SearchResult> = merged
        .into_values()
        .map(|m| SearchResult {
            object: m.candidate.object.clone(),
            lexical_score: m.lexical,
            semantic_score: m.semantic,
            fused_score: weights.lexical * m.lexical + weights.semantic * m.semantic,
            rank: 0,
        })
        .collect();

    results.sort_by(compare_results);
    results.truncate(top_k);
    for (i, r) in results.iter_mut().enumerate() {
        r.rank = i + 1;
    }
    results
}

fn compare_results(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.fused_score
        .partial_cmp(&a.fused_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.object.updated_at.cmp(&a.object.updated_at))
        .then_with(|| a.object.title.cmp(&b.object.title))
        .then_with(|| a.object.key().cmp(&b.object.key()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ObjectRef, ObjectType};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn cand(id: i64, title: &str, score: f64, updated: i64) -> Candidate {
        Candidate {
            id,
            object: ObjectRef {
                site_id: "s1".into(),
                object_type: ObjectType::Workbook,
                object_id: format!("w{}", id),
                title: title.into(),
                url: String::new(),
                project_name: String::new(),
                updated_at: at(updated),
            },
            raw_score: score,
        }
    }

    fn ids(results: &[SearchResult]) -> Vec<String> {
        results.iter().map(|r| r.object.object_id.clone()).collect()
    }

    #[test]
    fn test_normalize_all_equal() {
        let c = vec![cand(1, "a", 3.0, 0), cand(2, "b", 3.0, 0)];
        assert!(normalize_scores(&c).iter().all(|(_, s)| (*s - 1.0).abs() < 1e-9));
    }

    #[test]
    fn test_normalize_range() {
        let c = vec![cand(1, "a", 10.0, 0), cand(2, "b", 5.0, 0), cand(3, "c", 0.0, 0)];
        let n: Vec<f64> = normalize_scores(&c).iter().map(|(_, s)| *s).collect();
        assert_eq!(n, vec![1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_weights_renormalised() {
        let w = FusionWeights::new(3.0, 1.0);
        assert!((w.lexical - 0.75).abs() < 1e-9);
        assert!((w.semantic - 0.25).abs() < 1e-9);
        assert_eq!(FusionWeights::new(0.0, 0.0), FusionWeights::default());
    }

    #[test]
    fn test_both_paths_agree() {
        let lex = vec![cand(1, "Sales", 8.0, 0), cand(2, "Margin", 2.0, 0)];
        let sem = vec![cand(1, "Sales", 0.9, 0), cand(3, "Churn", 0.4, 0)];
        let out = fuse(&lex, &sem, FusionWeights::default(), 10);
        // w2 and w3 both fuse to 0.0; title decides
        assert_eq!(ids(&out), vec!["w1", "w3", "w2"]);
        assert!((out[0].fused_score - 1.0).abs() < 1e-9);
        assert_eq!(out[0].rank, 1);
        assert_eq!(out[2].rank, 3);
    }

    #[test]
    fn test_single_surviving_path_ranks_alone() {
        let lex = vec![cand(1, "a", 4.0, 0), cand(2, "b", 2.0, 0), cand(3, "c", 1.0, 0)];
        let out = fuse(&lex, &[], FusionWeights::new(0.1, 0.9), 10);
        assert_eq!(ids(&out), vec!["w1", "w2", "w3"]);
        assert!((out[0].fused_score - 1.0).abs() < 1e-9);
        assert_eq!(out[0].semantic_score, 0.0);
    }

    #[test]
    fn test_tie_breaks() {
        // equal fused scores: newer first, then title, then key
        let lex = vec![
            cand(1, "Beta", 1.0, 10),
            cand(2, "Alpha", 1.0, 10),
            cand(3, "Gamma", 1.0, 20),
            cand(4, "Alpha", 1.0, 10),
        ];
        let out = fuse(&lex, &[], FusionWeights::default(), 10);
        assert_eq!(ids(&out), vec!["w3", "w2", "w4", "w1"]);
    }

    #[test]
    fn test_top_k_truncates_and_is_stable() {
        let lex: Vec<Candidate> = (1..=20).map(|i| cand(i, "t", i as f64, 0)).collect();
        let a = fuse(&lex, &[], FusionWeights::default(), 5);
        let b = fuse(&lex, &[], FusionWeights::default(), 5);
        assert_eq!(a.len(), 5);
        assert_eq!(a, b);
        assert_eq!(a[0].object.object_id, "w20");
    }

    #[test]
    fn test_empty_inputs() {
        assert!(fuse(&[], &[], FusionWeights::default(), 10).is_empty());
    }
}

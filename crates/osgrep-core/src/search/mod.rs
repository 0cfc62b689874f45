//! Hybrid retrieval: dense ANN + FTS5 candidate generation, reciprocal
//! rank fusion, structural/path/query boosts, and late-interaction
//! (MaxSim) reranking.
//!
//! Pipeline, per query:
//!
//! 1. Encode the query with both encoders via the worker pool.
//! 2. Stage 1 (parallel): vector ANN over `dense` (`PRE_RERANK_K =
//!    max(floor, 4k)`), a secondary `pooled_colbert` lookup when the
//!    dense stage returns too few candidates, and FTS5 over `text`. All
//!    three honor `path_prefix` and the filter DSL.
//! 3. Stage 2: fuse by chunk id, keeping the best-ranked occurrence of
//!    each id, with reciprocal rank fusion (`1/(K+rank)`, summed across
//!    lists).
//! 4. Stage 3: multiplicative structural/path/query boosts.
//! 5. Stage 4: the top `PRE_RERANK_K` by boosted score go to the pool's
//!    MaxSim reranker; the final score blends `max_sim` and the boosted
//!    fused score with weight `alpha`.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::SearchConfig;
use crate::error::OsgrepResult;
use crate::pool::WorkerPool;
use crate::types::{ChunkKind, FilterExpr, Provenance, SearchResult};
use crate::vector::{ScoredChunk, Storage, VectorField};

/// Blend weight for the final score: `final = alpha * max_sim + (1 -
/// alpha) * boosted_fused`.
const RERANK_ALPHA: f64 = 0.7;

/// Fraction of `PRE_RERANK_K` below which the dense candidate list is
/// considered thin enough to also consult the secondary
/// `pooled_colbert` ANN signal (Stage 1 fallback).
const THIN_DENSE_THRESHOLD_FRACTION: f64 = 0.5;

/// Hybrid retriever: owns no index state of its own, just handles to the
/// storage and worker pool it queries.
pub struct Retriever {
    pool: WorkerPool,
    storage: Arc<Storage>,
    config: SearchConfig,
}

/// Provenance accumulated through Stage 2/3, before the Stage 4 rerank
/// fills in `max_sim_score`.
#[derive(Debug, Clone)]
struct BoostedProvenance {
    dense_rank: Option<u32>,
    keyword_rank: Option<u32>,
    rrf_score: f64,
    boost: f64,
    boosted_score: f64,
    max_sim_score: Option<f64>,
}

impl Retriever {
    /// Build a retriever over an already-open storage handle and worker pool.
    pub fn new(pool: WorkerPool, storage: Arc<Storage>, config: SearchConfig) -> Self {
        Self { pool, storage, config }
    }

    /// Run a hybrid search for `query`, returning up to `k` results.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        path_prefix: Option<&str>,
        filter: Option<FilterExpr>,
    ) -> OsgrepResult<Vec<SearchResult>> {
        let k = k.clamp(1, self.config.max_limit);
        let pre_rerank_k = self.config.candidate_pool_size.max(4 * k);

        let encoding = self.pool.encode_query(query.to_string()).await?;

        let dense_hits = self.storage.vector_search(
            VectorField::Dense,
            &encoding.dense,
            pre_rerank_k,
            path_prefix,
            filter.as_ref(),
        )?;

        let thin = (dense_hits.len() as f64) < (pre_rerank_k as f64) * THIN_DENSE_THRESHOLD_FRACTION;
        let pooled_hits = if thin {
            let pooled = encoding.pooled_colbert();
            self.storage.vector_search(VectorField::PooledColbert, &pooled, pre_rerank_k, path_prefix, filter.as_ref())?
        } else {
            Vec::new()
        };

        let keyword_hits = self.storage.fts_search(query, pre_rerank_k, path_prefix, filter.as_ref())?;

        let fused = fuse(&self.config, dense_hits, pooled_hits, keyword_hits);
        let mut boosted: Vec<(ScoredChunk, BoostedProvenance)> = apply_boosts(fused, query);
        boosted.sort_by(|a, b| {
            b.1.boosted_score
                .total_cmp(&a.1.boosted_score)
                .then_with(|| a.0.chunk.path.cmp(&b.0.chunk.path))
                .then_with(|| a.0.chunk.line_start.cmp(&b.0.chunk.line_start))
        });
        boosted.truncate(pre_rerank_k);

        let reranker = &self.config.reranker;
        // Only the top `reranker.max_candidates` (by boosted score) pay for
        // a MaxSim pass; anything beyond that within the pre-rerank window
        // still makes it into the result set, just scored on the boosted
        // fused score alone rather than being dropped.
        let rerank_cutoff = boosted.len().min(reranker.max_candidates);
        let tail = boosted.split_off(rerank_cutoff);

        let mut results: Vec<(ScoredChunk, BoostedProvenance, f64)> = if reranker.enabled && !boosted.is_empty() {
            let candidates: Vec<_> = boosted.iter().map(|(c, _)| c.chunk.colbert.clone()).collect();
            match self.pool.rerank(encoding.colbert.clone(), candidates).await {
                Ok(scores) => boosted
                    .into_iter()
                    .zip(scores)
                    .map(|((scored, mut prov), max_sim)| {
                        prov.max_sim_score = Some(max_sim);
                        let final_score = RERANK_ALPHA * max_sim + (1.0 - RERANK_ALPHA) * prov.boosted_score;
                        (scored, prov, final_score)
                    })
                    .collect(),
                Err(e) => {
                    if reranker.allow_pooled_fallback {
                        tracing::warn!(error = %e, "reranker unavailable, falling back to pooled-colbert cosine scoring");
                        let query_pooled = encoding.pooled_colbert();
                        boosted
                            .into_iter()
                            .map(|(scored, mut prov)| {
                                let pooled_sim = pooled_cosine_score(&query_pooled, &scored.chunk.pooled_colbert);
                                prov.max_sim_score = Some(pooled_sim);
                                let final_score = RERANK_ALPHA * pooled_sim + (1.0 - RERANK_ALPHA) * prov.boosted_score;
                                (scored, prov, final_score)
                            })
                            .collect()
                    } else {
                        tracing::warn!(error = %e, "reranker unavailable, falling back to boosted fused score");
                        without_rerank(boosted)
                    }
                }
            }
        } else {
            without_rerank(boosted)
        };
        results.extend(without_rerank(tail));

        results.sort_by(|a, b| {
            b.2.total_cmp(&a.2)
                .then_with(|| a.0.chunk.path.cmp(&b.0.chunk.path))
                .then_with(|| a.0.chunk.line_start.cmp(&b.0.chunk.line_start))
        });
        results.truncate(k);

        Ok(results
            .into_iter()
            .enumerate()
            .map(|(rank, (scored, prov, final_score))| SearchResult {
                text: scored.chunk.text,
                path: scored.chunk.path,
                line_start: scored.chunk.line_start,
                line_end: scored.chunk.line_end,
                role: scored.chunk.role,
                defined_symbols: scored.chunk.defined_symbols,
                score: final_score,
                rank: rank as u32,
                provenance: Provenance {
                    dense_rank: prov.dense_rank,
                    keyword_rank: prov.keyword_rank,
                    rrf_score: prov.rrf_score,
                    boost: prov.boost,
                    max_sim_score: prov.max_sim_score,
                },
            })
            .collect())
    }
}

/// Cosine similarity between the query's pooled colbert vector and a
/// chunk's `pooled_colbert`, used as a cheap stand-in for a full MaxSim
/// pass when the pool can't service one (see `RerankerConfig::allow_pooled_fallback`).
/// Both vectors are already unit-norm, so this is a plain dot product.
fn pooled_cosine_score(query_pooled: &[f32], chunk_pooled: &[f32]) -> f64 {
    if query_pooled.len() != chunk_pooled.len() || query_pooled.is_empty() {
        return 0.0;
    }
    f64::from(query_pooled.iter().zip(chunk_pooled).map(|(a, b)| a * b).sum::<f32>())
}

fn without_rerank(boosted: Vec<(ScoredChunk, BoostedProvenance)>) -> Vec<(ScoredChunk, BoostedProvenance, f64)> {
    boosted
        .into_iter()
        .map(|(scored, prov)| {
            let final_score = prov.boosted_score;
            (scored, prov, final_score)
        })
        .collect()
}

fn empty_provenance() -> BoostedProvenance {
    BoostedProvenance { dense_rank: None, keyword_rank: None, rrf_score: 0.0, boost: 1.0, boosted_score: 0.0, max_sim_score: None }
}

/// Reciprocal-rank-fuse the three candidate lists by chunk id, keeping
/// the best-ranked occurrence of each id and summing `1/(K+rank+1)`
/// across every list it appears in (rank is 0-based, so `+1` keeps the
/// best-ranked hit's contribution at `1/(K+1)` rather than `1/K`).
fn fuse(
    config: &SearchConfig,
    dense_hits: Vec<ScoredChunk>,
    pooled_hits: Vec<ScoredChunk>,
    keyword_hits: Vec<ScoredChunk>,
) -> HashMap<Uuid, (ScoredChunk, BoostedProvenance)> {
    let k_const = f64::from(config.rrf_k);
    let mut fused: HashMap<Uuid, (ScoredChunk, BoostedProvenance)> = HashMap::new();

    for (rank, hit) in dense_hits.into_iter().enumerate() {
        let entry = fused.entry(hit.chunk.id).or_insert_with(|| (hit.clone(), empty_provenance()));
        entry.1.dense_rank = Some(entry.1.dense_rank.map_or(rank as u32, |r| r.min(rank as u32)));
        entry.1.rrf_score += 1.0 / (k_const + rank as f64 + 1.0);
    }

    for (rank, hit) in pooled_hits.into_iter().enumerate() {
        let entry = fused.entry(hit.chunk.id).or_insert_with(|| (hit.clone(), empty_provenance()));
        entry.1.rrf_score += 1.0 / (k_const + rank as f64 + 1.0);
    }

    for (rank, hit) in keyword_hits.into_iter().enumerate() {
        let entry = fused.entry(hit.chunk.id).or_insert_with(|| (hit.clone(), empty_provenance()));
        entry.1.keyword_rank = Some(entry.1.keyword_rank.map_or(rank as u32, |r| r.min(rank as u32)));
        entry.1.rrf_score += 1.0 / (k_const + rank as f64 + 1.0);
    }

    fused
}

/// Apply Stage 3's multiplicative structural/path/query boosts.
fn apply_boosts(
    fused: HashMap<Uuid, (ScoredChunk, BoostedProvenance)>,
    query: &str,
) -> Vec<(ScoredChunk, BoostedProvenance)> {
    let is_question = has_question_word(query);

    fused
        .into_values()
        .map(|(scored, mut prov)| {
            let mut boost = 1.0;
            if scored.chunk.kind.is_structurally_boosted() {
                boost *= 1.20;
            }
            if is_test_path(&scored.chunk.path) {
                boost *= 0.75;
            }
            if is_docs_path(&scored.chunk.path) {
                boost *= 0.85;
            }
            if scored.chunk.kind == ChunkKind::Anchor && is_question {
                boost *= 1.10;
            }
            prov.boost = boost;
            prov.boosted_score = prov.rrf_score * boost;
            (scored, prov)
        })
        .collect()
}

fn has_question_word(query: &str) -> bool {
    let lower = query.to_ascii_lowercase();
    ["how", "what", "where", "why", "when", "which", "who"]
        .iter()
        .any(|word| lower.split(|c: char| !c.is_alphanumeric()).any(|token| token == *word))
}

fn is_test_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.split('/').any(|seg| seg == "test" || seg == "tests" || seg == "__tests__" || seg == "spec")
        || lower.contains(".test.")
        || lower.contains(".spec.")
        || lower.ends_with("_test.rs")
        || lower.ends_with("_spec.rb")
}

fn is_docs_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.split('/').any(|seg| seg == "docs" || seg == "doc") || lower.ends_with(".md") || lower.ends_with(".mdx")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, ChunkRole, ColbertGrid};
    use std::collections::BTreeSet;

    fn chunk(path: &str, kind: ChunkKind) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            path: path.into(),
            hash: "h".into(),
            line_start: 1,
            line_end: 2,
            text: "body".into(),
            context_prev: String::new(),
            context_next: String::new(),
            kind,
            role: ChunkRole::Implementation,
            defined_symbols: BTreeSet::new(),
            dense: vec![],
            colbert: ColbertGrid::default(),
            pooled_colbert: vec![],
        }
    }

    #[test]
    fn rrf_sums_across_lists_and_tracks_ranks() {
        let config = SearchConfig::default();
        let shared = chunk("src/a.rs", ChunkKind::Function);
        let dense = vec![ScoredChunk { chunk: shared.clone(), score: 0.9 }];
        let keyword = vec![ScoredChunk { chunk: shared.clone(), score: 1.0 }];
        let fused = fuse(&config, dense, Vec::new(), keyword);

        let (_, prov) = fused.get(&shared.id).unwrap();
        assert_eq!(prov.dense_rank, Some(0));
        assert_eq!(prov.keyword_rank, Some(0));
        let expected = 2.0 / (f64::from(config.rrf_k) + 1.0);
        assert!((prov.rrf_score - expected).abs() < 1e-9);
    }

    #[test]
    fn function_and_anchor_boosts_compose_multiplicatively() {
        let mut fused = HashMap::new();
        let c = chunk("src/a.rs", ChunkKind::Anchor);
        fused.insert(c.id, (ScoredChunk { chunk: c, score: 1.0 }, empty_provenance()));
        let boosted = apply_boosts(fused, "what does this do");
        assert!((boosted[0].1.boost - 1.10).abs() < 1e-9);
    }

    #[test]
    fn structural_boost_applies_to_functions() {
        let mut fused = HashMap::new();
        let c = chunk("src/a.rs", ChunkKind::Function);
        fused.insert(c.id, (ScoredChunk { chunk: c, score: 1.0 }, empty_provenance()));
        let boosted = apply_boosts(fused, "a plain query");
        assert!((boosted[0].1.boost - 1.20).abs() < 1e-9);
    }

    #[test]
    fn test_file_path_gets_penalized() {
        assert!(is_test_path("src/tests/parser_test.rs"));
        assert!(is_test_path("lib/foo.test.js"));
        assert!(!is_test_path("src/lib.rs"));
    }

    #[test]
    fn docs_path_gets_penalized() {
        assert!(is_docs_path("docs/guide.md"));
        assert!(is_docs_path("README.md"));
        assert!(!is_docs_path("src/lib.rs"));
    }

    #[test]
    fn question_word_detection_matches_whole_words_only() {
        assert!(has_question_word("how do I configure logging"));
        assert!(!has_question_word("showcase the widget"));
    }

    #[test]
    fn pooled_cosine_score_is_plain_dot_product_of_unit_vectors() {
        let a = vec![1.0_f32, 0.0, 0.0];
        let b = vec![0.6_f32, 0.8, 0.0];
        assert!((pooled_cosine_score(&a, &b) - 0.6).abs() < 1e-6);
    }

    #[test]
    fn pooled_cosine_score_mismatched_lengths_is_zero() {
        assert_eq!(pooled_cosine_score(&[1.0, 0.0], &[1.0]), 0.0);
    }
}

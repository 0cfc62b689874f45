//! Late-interaction (MaxSim) rerank scoring.
//!
//! This runs inside a worker process (see `pool::worker`), on the same
//! token grids the embedding pass already produced -- there is no
//! separate cross-encoder model. Given a query token matrix and a
//! candidate document's quantized colbert grid, the score is:
//!
//! ```text
//! score = Σ_i max_j (Q_i · D_j)
//! ```
//!
//! summed over query rows, maximized over document rows, with document
//! rows dequantized on the fly as `int8 * scale`. Query rows are expected
//! to already be L2-normalized (`QueryEncoding` guarantees this).

use crate::types::ColbertGrid;

/// Score a single document grid against a query token matrix.
///
/// `query_matrix` is `[q_tokens, COLBERT_DIM]`, each row unit-norm.
/// `doc` is the candidate's quantized token grid. Returns `0.0` for an
/// empty query or an empty document grid -- there is nothing to sum.
pub fn max_sim_score(query_matrix: &[Vec<f32>], doc: &ColbertGrid) -> f64 {
    if query_matrix.is_empty() || doc.is_empty() {
        return 0.0;
    }

    let doc_rows: Vec<Vec<f32>> = (0..doc.len()).map(|i| doc.dequantize_row(i)).collect();

    query_matrix
        .iter()
        .map(|q_row| {
            doc_rows
                .iter()
                .map(|d_row| dot(q_row, d_row))
                .fold(f32::NEG_INFINITY, f32::max)
        })
        .map(f64::from)
        .sum()
}

/// Score a batch of candidate grids against the same query matrix, in the
/// order given. This is what the pool's `Rerank` RPC exposes.
pub fn rerank_batch(query_matrix: &[Vec<f32>], candidates: &[ColbertGrid]) -> Vec<f64> {
    candidates.iter().map(|doc| max_sim_score(query_matrix, doc)).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_from(rows: Vec<Vec<f32>>) -> ColbertGrid {
        ColbertGrid::quantize(&rows)
    }

    #[test]
    fn empty_query_or_doc_scores_zero() {
        let doc = grid_from(vec![vec![1.0; crate::types::COLBERT_DIM]]);
        assert_eq!(max_sim_score(&[], &doc), 0.0);

        let empty_doc = ColbertGrid::default();
        let query = vec![vec![1.0; crate::types::COLBERT_DIM]];
        assert_eq!(max_sim_score(&query, &empty_doc), 0.0);
    }

    #[test]
    fn identical_single_token_scores_near_one() {
        let mut row = vec![0.0_f32; crate::types::COLBERT_DIM];
        row[0] = 1.0;
        let doc = grid_from(vec![row.clone()]);
        let query = vec![row];
        let score = max_sim_score(&query, &doc);
        assert!((score - 1.0).abs() < 0.02, "expected ~1.0, got {score}");
    }

    #[test]
    fn max_sim_is_invariant_to_doc_row_permutation() {
        let mut a = vec![0.0_f32; crate::types::COLBERT_DIM];
        a[0] = 1.0;
        let mut b = vec![0.0_f32; crate::types::COLBERT_DIM];
        b[1] = 1.0;

        let doc1 = grid_from(vec![a.clone(), b.clone()]);
        let doc2 = grid_from(vec![b, a.clone()]);
        let query = vec![a];

        let s1 = max_sim_score(&query, &doc1);
        let s2 = max_sim_score(&query, &doc2);
        assert!((s1 - s2).abs() < 1e-6);
    }

    #[test]
    fn rerank_batch_preserves_order() {
        let mut strong = vec![0.0_f32; crate::types::COLBERT_DIM];
        strong[0] = 1.0;
        let mut weak = vec![0.0_f32; crate::types::COLBERT_DIM];
        weak[0] = 0.01;

        let query = vec![strong.clone()];
        let candidates = vec![grid_from(vec![weak]), grid_from(vec![strong])];
        let scores = rerank_batch(&query, &candidates);
        assert_eq!(scores.len(), 2);
        assert!(scores[1] > scores[0]);
    }
}

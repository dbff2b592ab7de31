//! Softmax and top-k ranking over a logit vector.

use std::cmp::Ordering;

/// Number of candidates shown for each prediction.
pub const DEFAULT_TOP_K: usize = 50;

/// `exp(v_i) / sum_j exp(v_j)`, shifted by the maximum so large logits do not overflow.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Indices of the `k` largest probabilities, highest first.
///
/// The sort is stable, so equal probabilities keep ascending index order.
pub fn rank(probs: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    indexed.truncate(k);
    indexed
}

/// One candidate next token.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenProbability {
    pub token_id: usize,
    pub text: String,
    pub probability: f32,
}

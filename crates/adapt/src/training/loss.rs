//! Neighborhood-consistency and diversity losses for source-free adaptation.
//!
//! Both loss terms are generic over `B: Backend` and operate on softmax
//! probabilities. Neighbor scores and weights are constants: they come from
//! the banks, never from the current graph.

use burn::prelude::*;

/// Neighbor weights `clamp(exp(s) - 1, min, max)` from cosine similarities.
///
/// # Arguments
/// - `similarities`: shape `(batch, K)`, similarity of each sample to its
///   K nearest bank entries
pub fn neighbor_weights<B: Backend>(
    similarities: Tensor<B, 2>,
    min_weight: f64,
    max_weight: f64,
) -> Tensor<B, 2> {
    similarities.exp().sub_scalar(1.0).clamp(min_weight, max_weight)
}

/// Weighted neighbor agreement: `mean_b Σ_k -(p_b · s_bk) w_bk`.
///
/// # Arguments
/// - `probs`: shape `(batch, C)`, current softmax outputs
/// - `neighbor_scores`: shape `(batch, K, C)`, banked scores of the neighbors
/// - `weights`: shape `(batch, K)`
///
/// # Returns
/// Scalar loss tensor of shape `(1,)`. Lower when predictions agree with
/// confident neighbors.
pub fn neighbor_agreement_loss<B: Backend>(
    probs: Tensor<B, 2>,
    neighbor_scores: Tensor<B, 3>,
    weights: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let [batch, k, c] = neighbor_scores.dims();
    let probs = probs.unsqueeze_dim::<3>(1).expand([batch, k, c]);
    let dot = (probs * neighbor_scores).sum_dim(2).squeeze::<2>(2); // (batch, K)
    (dot.neg() * weights).sum_dim(1).mean()
}

/// Diversity term `Σ_c p̄_c log(p̄_c + eps)` over the batch-mean prediction.
///
/// Minimizing it maximizes the entropy of the mean prediction, which keeps
/// the batch from collapsing onto one class. Ranges from `-ln C` (uniform)
/// to about 0 (collapsed).
pub fn information_maximization<B: Backend>(probs: Tensor<B, 2>, eps: f64) -> Tensor<B, 1> {
    let mean = probs.mean_dim(0); // (1, C)
    (mean.clone() * mean.add_scalar(eps).log()).sum()
}

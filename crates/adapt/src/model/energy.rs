//! Free-energy scoring of classifier logits.
//!
//! Convention: lower energy = more confident (in-distribution), higher
//! energy = uncertain or likely out-of-distribution.

use burn::prelude::*;

/// Numerically stable `log(sum(exp(x)))` along `dim`, keeping the dimension.
pub fn logsumexp<B: Backend, const D: usize>(x: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let max = x.clone().max_dim(dim).detach();
    (x - max.clone()).exp().sum_dim(dim).log() + max
}

/// Per-sample energy `-logsumexp(logits)` over the class dimension.
///
/// Input shape: `(batch, classes)`
/// Output shape: `(batch,)`
pub fn energy<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 1> {
    logsumexp(logits, 1).neg().squeeze::<1>(1)
}

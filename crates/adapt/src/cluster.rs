//! Nearest-centroid pseudo-label refinement.
//!
//! Centroids are the affinity-weighted means of the (prepared) features; each
//! sample moves to its nearest centroid by cosine distance. A fixed number of
//! extra rounds re-centres on the previous hard assignment. Classes with no
//! assigned samples in a round are left out of that round's centroid set.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::{ensure_len, AdaptError, Result};
use crate::model::bridge::{indices_to_tensor, int_tensor_to_indices, slice_to_tensor};
use crate::selection::SelectionLedger;

/// Energy given to oracle-labeled samples so they always count as confident.
pub const ORACLE_ENERGY: f32 = -100_000.0;

/// Row-wise L2 normalization, `x / max(‖x‖, eps)`.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>, eps: f64) -> Tensor<B, 2> {
    let dims = x.dims();
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(eps);
    x / norm.expand(dims)
}

/// Append a constant `1` column to every feature row, then L2-normalize.
pub fn prepare_features<B: Backend>(features: Tensor<B, 2>, eps: f64) -> Tensor<B, 2> {
    let [n, _] = features.dims();
    let ones = Tensor::<B, 2>::ones([n, 1], &features.device());
    l2_normalize(Tensor::cat(vec![features, ones], 1), eps)
}

/// Scale rows whose energy is strictly above `unknown_threshold` by `factor`.
pub fn downweight_unknown<B: Backend>(
    features: Tensor<B, 2>,
    energies: &[f32],
    unknown_threshold: f32,
    factor: f32,
) -> Result<Tensor<B, 2>> {
    let dims = features.dims();
    ensure_len("downweight_unknown: energies", dims[0], energies.len())?;
    let weights: Vec<f32> = energies
        .iter()
        .map(|&e| if e > unknown_threshold { factor } else { 1.0 })
        .collect();
    let weights = slice_to_tensor::<B>(&weights, &features.device()).reshape([dims[0], 1]);
    Ok(features * weights.expand(dims))
}

/// Pairwise cosine distance `1 - cos(a_i, b_j)`, shape `(rows_a, rows_b)`.
///
/// Zero-norm rows give distance 1 instead of NaN.
pub fn cosine_distance<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>, eps: f64) -> Tensor<B, 2> {
    let a = l2_normalize(a, eps);
    let b = l2_normalize(b, eps);
    a.matmul(b.transpose()).neg().add_scalar(1.0)
}

fn one_hot<B: Backend>(labels: &[usize], num_classes: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut data = vec![0.0_f32; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        data[row * num_classes + label] = 1.0;
    }
    Tensor::from_data(TensorData::new(data, [labels.len(), num_classes]), device)
}

/// Iterative nearest-centroid refiner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusteringRefiner {
    /// Refinement rounds after the initial soft-affinity assignment.
    pub extra_rounds: usize,
    /// Guard added to centroid mass and norms.
    pub eps: f64,
}

impl Default for ClusteringRefiner {
    fn default() -> Self {
        Self {
            extra_rounds: 1,
            eps: 1e-8,
        }
    }
}

impl ClusteringRefiner {
    pub fn new(extra_rounds: usize) -> Self {
        Self {
            extra_rounds,
            ..Self::default()
        }
    }

    /// Refine hard pseudo-labels.
    ///
    /// # Arguments
    /// - `affinity`: soft assignment, shape `(N, K)`
    /// - `features`: prepared (and possibly down-weighted) features, `(N, D)`
    /// - `predictions`: current hard labels, length `N`, each `< K`
    pub fn refine<B: Backend>(
        &self,
        affinity: Tensor<B, 2>,
        features: Tensor<B, 2>,
        predictions: &[usize],
    ) -> Result<Vec<usize>> {
        let [n, k] = affinity.dims();
        ensure_len("refine: feature rows", n, features.dims()[0])?;
        ensure_len("refine: predictions", n, predictions.len())?;
        if n == 0 {
            return Ok(Vec::new());
        }

        let device = features.device();
        let mut labels = self.assign(affinity, features.clone(), predictions, k)?;
        for _ in 0..self.extra_rounds {
            let affinity = one_hot::<B>(&labels, k, &device);
            labels = self.assign(affinity, features.clone(), &labels, k)?;
        }
        Ok(labels)
    }

    /// One centroid + nearest-assignment pass. Only classes present in
    /// `hard` take part.
    fn assign<B: Backend>(
        &self,
        affinity: Tensor<B, 2>,
        features: Tensor<B, 2>,
        hard: &[usize],
        num_classes: usize,
    ) -> Result<Vec<usize>> {
        let mut counts = vec![0usize; num_classes];
        for &label in hard {
            if label >= num_classes {
                return Err(AdaptError::IndexOutOfRange {
                    index: label,
                    len: num_classes,
                });
            }
            counts[label] += 1;
        }
        let labelset: Vec<usize> = (0..num_classes).filter(|&c| counts[c] > 0).collect();
        if labelset.len() < num_classes {
            tracing::debug!(
                active = labelset.len(),
                num_classes,
                "Excluding empty classes from centroid set"
            );
        }

        let [_, dim] = features.dims();
        let device = features.device();
        let mass = affinity.clone().sum_dim(0).swap_dims(0, 1).add_scalar(self.eps); // (K, 1)
        let centroids = affinity.transpose().matmul(features.clone()) / mass.expand([num_classes, dim]);
        let centroids = centroids.select(0, indices_to_tensor::<B>(&labelset, &device));

        let nearest = cosine_distance(features, centroids, self.eps).argmin(1);
        Ok(int_tensor_to_indices(nearest)
            .into_iter()
            .map(|j| labelset[j])
            .collect())
    }
}

/// Force every ledger member back to its oracle label and give it
/// [`ORACLE_ENERGY`].
pub fn apply_oracle_labels(
    labels: &mut [usize],
    energies: &mut [f32],
    ledger: &SelectionLedger,
    truth: &[usize],
) -> Result<()> {
    ensure_len("apply_oracle_labels: energies", labels.len(), energies.len())?;
    ensure_len("apply_oracle_labels: truth", labels.len(), truth.len())?;
    for index in ledger.iter() {
        if index >= labels.len() {
            return Err(AdaptError::IndexOutOfRange {
                index,
                len: labels.len(),
            });
        }
        labels[index] = truth[index];
        energies[index] = ORACLE_ENERGY;
    }
    Ok(())
}

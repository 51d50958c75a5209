//! One-step neighborhood-consistency trainer.
//!
//! Each step writes the batch into the banks, finds every sample's K nearest
//! bank entries and their M nearest entries in turn, and pulls the batch
//! predictions toward the banked scores of both neighbor sets while a
//! diversity term keeps the mean prediction spread over classes.

use std::marker::PhantomData;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::bank::NeighborBanks;
use crate::cluster::l2_normalize;
use crate::error::{ensure_len, AdaptError, Result};
use crate::model::bridge::{tensor_to_f64, tensor_to_vec};
use crate::model::energy::energy;
use crate::model::network::{Backbone, Classifier};
use crate::training::loss::{information_maximization, neighbor_agreement_loss, neighbor_weights};
use crate::training::metrics::StepMetrics;

/// Neighbor trainer hyper-parameters (`[neighbors]` TOML section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborConfig {
    /// First-order neighbors per sample.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Second-order neighbors per first-order neighbor.
    #[serde(default = "default_m")]
    pub m: usize,
    /// Fixed weight of every second-order neighbor.
    #[serde(default = "default_second_order_weight")]
    pub second_order_weight: f64,
    /// Lower clamp of first-order neighbor weights.
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
    /// Upper clamp of first-order neighbor weights.
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
    /// Epsilon inside the diversity term's logarithm.
    #[serde(default = "default_diversity_eps")]
    pub diversity_eps: f64,
    /// Lower bound on feature norms when normalizing.
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    /// Learning rate passed to every optimizer step.
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// AdamW weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Maximum gradient norm for clipping.
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
}

fn default_k() -> usize {
    5
}
fn default_m() -> usize {
    5
}
fn default_second_order_weight() -> f64 {
    0.1
}
fn default_min_weight() -> f64 {
    0.1
}
fn default_max_weight() -> f64 {
    1.0
}
fn default_diversity_eps() -> f64 {
    1e-6
}
fn default_norm_eps() -> f64 {
    1e-12
}
fn default_lr() -> f64 {
    1e-3
}
fn default_weight_decay() -> f64 {
    1e-3
}
fn default_max_grad_norm() -> f64 {
    1.0
}

impl Default for NeighborConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            m: default_m(),
            second_order_weight: default_second_order_weight(),
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
            diversity_eps: default_diversity_eps(),
            norm_eps: default_norm_eps(),
            lr: default_lr(),
            weight_decay: default_weight_decay(),
            max_grad_norm: default_max_grad_norm(),
        }
    }
}

impl NeighborConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 || self.m == 0 {
            return Err(AdaptError::InvalidConfig(format!(
                "neighbor counts must be positive (k={}, m={})",
                self.k, self.m
            )));
        }
        if self.min_weight > self.max_weight {
            return Err(AdaptError::InvalidConfig(format!(
                "min_weight {} exceeds max_weight {}",
                self.min_weight, self.max_weight
            )));
        }
        if self.lr.is_nan() || self.lr <= 0.0 {
            return Err(AdaptError::InvalidConfig(format!("lr must be positive, got {}", self.lr)));
        }
        Ok(())
    }

    /// AdamW with gradient-norm clipping, configured from this section.
    pub fn adamw<B, M>(&self) -> impl Optimizer<M, B>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        AdamWConfig::new()
            .with_weight_decay(self.weight_decay as f32)
            .with_grad_clipping(Some(GradientClippingConfig::Norm(self.max_grad_norm as f32)))
            .init()
    }
}

/// Runs neighborhood-consistency steps against borrowed banks.
///
/// The model is consumed and returned by every step; the optimizer state
/// lives here between steps.
pub struct NeighborTrainer<B, M, O> {
    config: NeighborConfig,
    optimizer: O,
    steps: usize,
    _marker: PhantomData<(B, M)>,
}

impl<B, M, O> NeighborTrainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Backbone<B> + Classifier<B>,
    O: Optimizer<M, B>,
{
    pub fn new(config: NeighborConfig, optimizer: O) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            optimizer,
            steps: 0,
            _marker: PhantomData,
        })
    }

    pub fn config(&self) -> &NeighborConfig {
        &self.config
    }

    /// Steps taken so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// One forward, bank update, loss and optimizer step.
    ///
    /// # Arguments
    /// - `model`: consumed and returned updated
    /// - `inputs`: raw batch, shape `(batch, d_input)`
    /// - `indices`: global pool index of every batch row
    /// - `banks`: written at `indices`, then searched in full
    pub fn train_step(
        &mut self,
        model: M,
        inputs: Tensor<B, 2>,
        indices: &[usize],
        banks: &mut NeighborBanks,
    ) -> Result<(M, StepMetrics)> {
        let [batch, _] = inputs.dims();
        ensure_len("train_step: indices", batch, indices.len())?;
        if batch == 0 {
            return Err(AdaptError::ShapeMismatch {
                context: "train_step: batch rows",
                expected: 1,
                actual: 0,
            });
        }
        banks.check_indices(indices)?;
        let (k, m) = (self.config.k, self.config.m);
        let n = banks.len();
        if k + 1 > n {
            return Err(AdaptError::ShapeMismatch {
                context: "train_step: bank rows for K+1 neighbors",
                expected: k + 1,
                actual: n,
            });
        }
        if m + 1 > n {
            return Err(AdaptError::ShapeMismatch {
                context: "train_step: bank rows for M+1 neighbors",
                expected: m + 1,
                actual: n,
            });
        }

        let features = model.embed(inputs);
        let logits = model.logits(features.clone(), false);
        ensure_len("train_step: classes", banks.num_classes(), logits.dims()[1])?;
        let energies = energy(logits.clone());
        let probs = softmax(logits, 1);

        // Bank write happens before the search so the batch sees itself.
        let features = l2_normalize(features.inner(), self.config.norm_eps);
        banks.write(
            indices,
            &tensor_to_vec(features.clone()),
            &tensor_to_vec(probs.clone().inner()),
            &tensor_to_vec(energies.inner()),
        )?;

        let (score_near, weight_near, score_far, weight_far, mean_similarity) =
            self.neighbors(features, indices, banks)?;

        let first_order = neighbor_agreement_loss(
            probs.clone(),
            Tensor::from_inner(score_near),
            Tensor::from_inner(weight_near),
        );
        let second_order = neighbor_agreement_loss(
            probs.clone(),
            Tensor::from_inner(score_far),
            Tensor::from_inner(weight_far),
        );
        let diversity = information_maximization(probs, self.config.diversity_eps);
        let loss = first_order.clone() + second_order.clone() + diversity.clone();

        let metrics = StepMetrics {
            loss: tensor_to_f64(loss.clone().inner()),
            first_order: tensor_to_f64(first_order.inner()),
            second_order: tensor_to_f64(second_order.inner()),
            diversity: tensor_to_f64(diversity.inner()),
            mean_similarity,
        };

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let model = self.optimizer.step(self.config.lr, model, grads);
        self.steps += 1;

        tracing::debug!(
            step = self.steps,
            loss = metrics.loss,
            first_order = metrics.first_order,
            second_order = metrics.second_order,
            diversity = metrics.diversity,
            mean_similarity = metrics.mean_similarity,
            "Neighbor step"
        );
        Ok((model, metrics))
    }

    /// Neighbor scores and weights for a normalized batch, gradient free.
    ///
    /// Returns `(scores_k (b,K,C), weights_k (b,K), scores_km (b,K*M,C),
    /// weights_km (b,K*M), mean similarity)` and records each sample's mean
    /// first-order similarity in the banks.
    #[allow(clippy::type_complexity)]
    fn neighbors(
        &self,
        features: Tensor<B::InnerBackend, 2>,
        indices: &[usize],
        banks: &mut NeighborBanks,
    ) -> Result<(
        Tensor<B::InnerBackend, 3>,
        Tensor<B::InnerBackend, 2>,
        Tensor<B::InnerBackend, 3>,
        Tensor<B::InnerBackend, 2>,
        f64,
    )> {
        let (k, m) = (self.config.k, self.config.m);
        let [batch, _] = features.dims();
        let c = banks.num_classes();
        let device = features.device();
        let bank_features = banks.feature_tensor::<B::InnerBackend>(&device)?;
        let bank_scores = banks.score_tensor::<B::InnerBackend>(&device)?;

        // First order: column 0 is the sample itself.
        let sim = features.matmul(bank_features.clone().transpose()); // (b, N)
        let (dist_k, idx_k) = sim.topk_with_indices(k + 1, 1);
        let dist_k = dist_k.slice([0..batch, 1..k + 1]);
        let idx_k = idx_k.slice([0..batch, 1..k + 1]).reshape([batch * k]);

        let per_sample = tensor_to_vec(dist_k.clone().mean_dim(1));
        banks.record_similarities(indices, &per_sample)?;
        let mean_similarity = if per_sample.is_empty() {
            0.0
        } else {
            per_sample.iter().map(|&s| s as f64).sum::<f64>() / per_sample.len() as f64
        };

        let weight_near = neighbor_weights(dist_k, self.config.min_weight, self.config.max_weight);
        let score_near = bank_scores
            .clone()
            .select(0, idx_k.clone())
            .reshape([batch, k, c]);

        // Second order: nearest entries of each first-order neighbor, first dropped.
        let near_features = bank_features.clone().select(0, idx_k);
        let sim_far = near_features.matmul(bank_features.transpose()); // (b*K, N)
        let (_, idx_m) = sim_far.topk_with_indices(m + 1, 1);
        let idx_m = idx_m.slice([0..batch * k, 1..m + 1]).reshape([batch * k * m]);
        let score_far = bank_scores.select(0, idx_m).reshape([batch, k * m, c]);
        let weight_far = Tensor::full([batch, k * m], self.config.second_order_weight, &device);

        Ok((score_near, weight_near, score_far, weight_far, mean_similarity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::tensor::Distribution;

    use crate::model::network::{AdaptNet, AdaptNetConfig};
    use crate::pipeline::dataset::PoolDataset;

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn setup(
        n: usize,
    ) -> (
        AdaptNet<TestAutodiffBackend>,
        PoolDataset,
        NeighborBanks,
    ) {
        let device = Default::default();
        let net = AdaptNetConfig::new(4, 3)
            .with_d_hidden(8)
            .with_d_bottleneck(6)
            .init::<TestAutodiffBackend>(&device);
        let inputs = Tensor::<NdArray<f32>, 2>::random([n, 4], Distribution::Normal(0.0, 1.0), &device);
        let labels = (0..n).map(|i| i % 3).collect();
        let dataset = PoolDataset::new(tensor_to_vec(inputs), labels, 4).unwrap();
        let inference = net.valid();
        let banks = NeighborBanks::warm_up(
            &inference,
            dataset.batches::<NdArray<f32>>(4, &device).unwrap(),
            n,
            1e-12,
        )
        .unwrap();
        (net, dataset, banks)
    }

    fn small_config() -> NeighborConfig {
        NeighborConfig {
            k: 2,
            m: 2,
            lr: 1e-2,
            ..NeighborConfig::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let c = NeighborConfig::default();
        assert_eq!(c.k, 5);
        assert_eq!(c.m, 5);
        assert!((c.second_order_weight - 0.1).abs() < 1e-12);
        assert!((c.min_weight - 0.1).abs() < 1e-12);
        assert!((c.max_weight - 1.0).abs() < 1e-12);
        assert!((c.diversity_eps - 1e-6).abs() < 1e-18);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_k() {
        let c = NeighborConfig {
            k: 0,
            ..NeighborConfig::default()
        };
        assert!(matches!(c.validate(), Err(AdaptError::InvalidConfig(_))));
    }

    #[test]
    fn test_step_updates_banks_at_batch_indices() {
        let device = Default::default();
        let (net, dataset, mut banks) = setup(12);
        let before = banks.clone();
        let config = small_config();
        let optimizer = config.adamw::<TestAutodiffBackend, AdaptNet<TestAutodiffBackend>>();
        let mut trainer = NeighborTrainer::new(config, optimizer).unwrap();

        let indices = [1usize, 5, 9];
        let batch = dataset.batch_of::<TestAutodiffBackend>(&indices, &device).unwrap();
        let (_net, metrics) = trainer
            .train_step(net, batch.inputs, &batch.indices, &mut banks)
            .unwrap();

        assert_eq!(trainer.steps(), 1);
        assert!(metrics.loss.is_finite());
        for i in 0..12 {
            if indices.contains(&i) {
                assert!(banks.similarities()[i] != 0.0, "similarity recorded at {i}");
            } else {
                assert_eq!(banks.feature(i), before.feature(i));
                assert_eq!(banks.score(i), before.score(i));
                assert_eq!(banks.similarities()[i], 0.0);
            }
        }
    }

    #[test]
    fn test_step_changes_parameters() {
        let device = Default::default();
        let (net, dataset, mut banks) = setup(10);
        let config = small_config();
        let optimizer = config.adamw::<TestAutodiffBackend, AdaptNet<TestAutodiffBackend>>();
        let mut trainer = NeighborTrainer::new(config, optimizer).unwrap();

        let probe = Tensor::<TestAutodiffBackend, 2>::ones([1, 4], &device);
        let before = tensor_to_vec(net.logits(net.embed(probe.clone()), false).inner());
        let batch = dataset.batch_of::<TestAutodiffBackend>(&[0, 1, 2, 3], &device).unwrap();
        let (net, _) = trainer
            .train_step(net, batch.inputs, &batch.indices, &mut banks)
            .unwrap();
        let after = tensor_to_vec(net.logits(net.embed(probe), false).inner());
        let diff: f32 = before.iter().zip(&after).map(|(a, b)| (a - b).abs()).sum();
        assert!(diff > 0.0, "optimizer step should move the model");
    }

    #[test]
    fn test_step_rejects_small_bank() {
        let device = Default::default();
        let (net, dataset, mut banks) = setup(5);
        let config = NeighborConfig {
            k: 5,
            ..small_config()
        };
        let optimizer = config.adamw::<TestAutodiffBackend, AdaptNet<TestAutodiffBackend>>();
        let mut trainer = NeighborTrainer::new(config, optimizer).unwrap();
        let batch = dataset.batch_of::<TestAutodiffBackend>(&[0, 1], &device).unwrap();
        let err = trainer
            .train_step(net, batch.inputs, &batch.indices, &mut banks)
            .unwrap_err();
        assert!(matches!(err, AdaptError::ShapeMismatch { expected: 6, actual: 5, .. }));
    }

    #[test]
    fn test_step_rejects_out_of_range_index_without_writing() {
        let device = Default::default();
        let (net, _dataset, mut banks) = setup(8);
        let before = banks.clone();
        let config = small_config();
        let optimizer = config.adamw::<TestAutodiffBackend, AdaptNet<TestAutodiffBackend>>();
        let mut trainer = NeighborTrainer::new(config, optimizer).unwrap();
        let inputs = Tensor::<TestAutodiffBackend, 2>::zeros([2, 4], &device);
        let err = trainer.train_step(net, inputs, &[0, 8], &mut banks).unwrap_err();
        assert!(matches!(err, AdaptError::IndexOutOfRange { index: 8, len: 8 }));
        assert_eq!(banks, before);
    }
}

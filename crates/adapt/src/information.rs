//! Expected predictive information gain (EPIG) over Monte-Carlo samples of a
//! stochastic classifier.
//!
//! ```text
//! EPIG(x | x*) = I(y; y* | x, x*)
//!              = KL[ p(y, y* | x, x*) || p(y | x) p(y* | x*) ]
//! EPIG(x)      = E_{x*}[ EPIG(x | x*) ]
//! ```
//!
//! Joint and marginal predictive distributions are estimated from K
//! stochastic forward passes with a log-mean-exp over the sample axis; all
//! arithmetic stays in log space until the final KL expectation.

use burn::prelude::*;
use burn::tensor::activation::log_softmax;

use crate::error::{ensure_len, AdaptError, Result};
use crate::model::bridge::{rows_to_tensor, tensor_to_vec};
use crate::model::energy::logsumexp;
use crate::model::network::Classifier;

/// `logsumexp(x, dim) - ln(size(dim))`, keeping the dimension.
pub fn logmeanexp<B: Backend, const D: usize>(x: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let n = x.dims()[dim];
    logsumexp(x, dim).sub_scalar((n as f64).ln())
}

/// Discrete KL divergence `Σ p log(p / q)` over the last dimension.
///
/// `p` and `q` must hold strictly positive probabilities of the same shape.
/// The last dimension is kept with size 1.
pub fn kl_divergence<B: Backend, const D: usize>(p: Tensor<B, D>, q: Tensor<B, D>) -> Tensor<B, D> {
    (p.clone() * (p / q).log()).sum_dim(D - 1)
}

/// Run `n_model_samples` independent stochastic passes of `model` over
/// `inputs` and return log-probabilities of shape `(N, K, C)`.
///
/// Every pass draws a fresh stochastic mask, so pass `k` of input `i` is
/// independent of every other pass.
pub fn conditional_predict<B: Backend, C: Classifier<B>>(
    model: &C,
    inputs: Tensor<B, 2>,
    num_classes: usize,
    n_model_samples: usize,
) -> Result<Tensor<B, 3>> {
    if n_model_samples == 0 {
        return Err(AdaptError::InvalidConfig(
            "n_model_samples must be at least 1".to_string(),
        ));
    }
    ensure_len("conditional_predict: classes", num_classes, model.num_classes())?;

    let passes: Vec<Tensor<B, 2>> = (0..n_model_samples)
        .map(|_| model.logits(inputs.clone(), true))
        .collect();
    let logits: Tensor<B, 3> = Tensor::stack(passes, 1); // (N, K, C)
    ensure_len("conditional_predict: logits", num_classes, logits.dims()[2])?;
    Ok(log_softmax(logits, 2))
}

/// Conditional EPIG for every (pool, target) pair.
///
/// # Arguments
/// - `logprobs_pool`: shape `(N_p, K, C)`
/// - `logprobs_targ`: shape `(N_t, K, C)`
///
/// # Returns
/// Scores of shape `(N_p, N_t)`.
pub fn conditional_epig_from_logprobs<B: Backend>(
    logprobs_pool: Tensor<B, 3>,
    logprobs_targ: Tensor<B, 3>,
) -> Result<Tensor<B, 2>> {
    let [n_p, k, c] = logprobs_pool.dims();
    let [n_t, k_t, c_t] = logprobs_targ.dims();
    ensure_len("conditional_epig: model samples", k, k_t)?;
    ensure_len("conditional_epig: classes", c, c_t)?;

    let pool: Tensor<B, 5> = logprobs_pool.swap_dims(0, 1).reshape([k, n_p, 1, c, 1]);
    let targ: Tensor<B, 5> = logprobs_targ.swap_dims(0, 1).reshape([k, 1, n_t, 1, c]);

    // log p(y, y* | x, x*)
    let joint_shape = [k, n_p, n_t, c, c];
    let joint = pool.clone().expand(joint_shape) + targ.clone().expand(joint_shape);
    let joint = logmeanexp(joint, 0); // (1, N_p, N_t, C, C)

    // log p(y | x) + log p(y* | x*)
    let pair_shape = [1, n_p, n_t, c, c];
    let indep = logmeanexp(pool, 0).expand(pair_shape) + logmeanexp(targ, 0).expand(pair_shape);

    let scores = (joint.clone().exp() * (joint - indep)).sum_dim(4).sum_dim(3);
    Ok(scores.reshape([n_p, n_t]))
}

/// Average conditional scores `(N_p, N_t)` over the target axis → `(N_p,)`.
pub fn epig_from_conditional_scores<B: Backend>(scores: Tensor<B, 2>) -> Tensor<B, 1> {
    scores.mean_dim(1).squeeze::<1>(1)
}

/// EPIG per pool sample from pool and target log-probabilities.
pub fn epig_from_logprobs<B: Backend>(
    logprobs_pool: Tensor<B, 3>,
    logprobs_targ: Tensor<B, 3>,
) -> Result<Tensor<B, 1>> {
    let scores = conditional_epig_from_logprobs(logprobs_pool, logprobs_targ)?;
    Ok(epig_from_conditional_scores(scores))
}

/// Feature inputs accepted by [`EpigEstimator::estimate_epig`]: either host
/// rows or an existing tensor. Conversion happens once, on entry.
pub trait IntoFeatures<B: Backend> {
    fn into_features(self, device: &B::Device) -> Result<Tensor<B, 2>>;
}

impl<B: Backend> IntoFeatures<B> for Tensor<B, 2> {
    fn into_features(self, device: &B::Device) -> Result<Tensor<B, 2>> {
        Ok(self.to_device(device))
    }
}

impl<B: Backend> IntoFeatures<B> for &[Vec<f32>] {
    fn into_features(self, device: &B::Device) -> Result<Tensor<B, 2>> {
        rows_to_tensor(self, device)
    }
}

/// Chunked EPIG estimation over a pool against a bounded target subsample.
///
/// Target log-probabilities are sampled once and shared by every pool chunk,
/// so a pool sample's score does not depend on which chunk it falls in. The
/// target set is also walked in chunks; partial sums are combined before
/// dividing by the target count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpigEstimator {
    /// Stochastic passes per input (K).
    pub n_model_samples: usize,
    /// Pool samples scored per chunk.
    pub pool_chunk: usize,
    /// Only the first `target_limit` target samples are used.
    pub target_limit: usize,
    /// Target samples per inner chunk.
    pub target_chunk: usize,
}

impl Default for EpigEstimator {
    fn default() -> Self {
        Self {
            n_model_samples: 4,
            pool_chunk: 100,
            target_limit: 10_000,
            target_chunk: 1_000,
        }
    }
}

impl EpigEstimator {
    fn validate(&self) -> Result<()> {
        if self.n_model_samples == 0
            || self.pool_chunk == 0
            || self.target_limit == 0
            || self.target_chunk == 0
        {
            return Err(AdaptError::InvalidConfig(format!(
                "information gain sizes must be positive: {self:?}"
            )));
        }
        Ok(())
    }

    /// Score every pool sample, returning one EPIG value per pool row.
    ///
    /// `model` should be the inference (non-autodiff) model; stochasticity
    /// comes only from the classifier's Monte-Carlo dropout.
    pub fn estimate_epig<B: Backend, C: Classifier<B>>(
        &self,
        model: &C,
        pool: impl IntoFeatures<B>,
        target: impl IntoFeatures<B>,
        device: &B::Device,
    ) -> Result<Vec<f32>> {
        self.validate()?;
        let pool = pool.into_features(device)?;
        let target = target.into_features(device)?;
        let [n_pool, dim] = pool.dims();
        let [n_targ, dim_t] = target.dims();
        ensure_len("estimate_epig: feature dim", dim, dim_t)?;
        if n_pool == 0 {
            return Ok(Vec::new());
        }
        if n_targ == 0 {
            return Err(AdaptError::InvalidConfig(
                "information gain needs at least one target sample".to_string(),
            ));
        }

        let num_classes = model.num_classes();
        let k = self.n_model_samples;
        let n_t = n_targ.min(self.target_limit);
        let target = target.slice([0..n_t, 0..dim]);
        let targ_logprobs = conditional_predict(model, target, num_classes, k)?;

        let mut scores = Vec::with_capacity(n_pool);
        for start in (0..n_pool).step_by(self.pool_chunk) {
            let end = (start + self.pool_chunk).min(n_pool);
            let pool_logprobs = conditional_predict(
                model,
                pool.clone().slice([start..end, 0..dim]),
                num_classes,
                k,
            )?;

            let mut total: Option<Tensor<B, 1>> = None;
            for t_start in (0..n_t).step_by(self.target_chunk) {
                let t_end = (t_start + self.target_chunk).min(n_t);
                let targ_chunk = targ_logprobs
                    .clone()
                    .slice([t_start..t_end, 0..k, 0..num_classes]);
                let partial = conditional_epig_from_logprobs(pool_logprobs.clone(), targ_chunk)?
                    .sum_dim(1)
                    .squeeze::<1>(1);
                total = Some(match total {
                    Some(acc) => acc + partial,
                    None => partial,
                });
            }
            if let Some(total) = total {
                scores.extend(tensor_to_vec(total.div_scalar(n_t as f64)));
            }
        }

        tracing::debug!(
            n_pool,
            n_target = n_t,
            n_model_samples = k,
            "Estimated information gain"
        );
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::{Distribution, TensorData};

    use crate::model::bridge::indices_to_tensor;
    use crate::model::network::AdaptNetConfig;

    type TestBackend = NdArray<f32>;

    fn random_logprobs(n: usize, k: usize, c: usize) -> Tensor<TestBackend, 3> {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 3>::random([n, k, c], Distribution::Normal(0.0, 2.0), &device);
        log_softmax(logits, 2)
    }

    #[test]
    fn test_kl_nonnegative_and_zero_on_self() {
        let device = Default::default();
        let p = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.2_f32, 0.3, 0.5], [0.9, 0.05, 0.05]]),
            &device,
        );
        let q = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.4_f32, 0.4, 0.2], [0.1, 0.1, 0.8]]),
            &device,
        );
        let kl = tensor_to_vec(kl_divergence(p.clone(), q));
        assert!(kl.iter().all(|&v| v >= 0.0), "{kl:?}");
        let self_kl = tensor_to_vec(kl_divergence(p.clone(), p));
        assert!(self_kl.iter().all(|&v| v.abs() < 1e-6), "{self_kl:?}");
    }

    #[test]
    fn test_logmeanexp_constant() {
        let device = Default::default();
        for k in [1usize, 3, 17] {
            let x = Tensor::<TestBackend, 2>::full([2, k], -1.5, &device);
            let out = tensor_to_vec(logmeanexp(x, 1));
            for v in out {
                assert!((v + 1.5).abs() < 1e-5, "k={k}: got {v}");
            }
        }
    }

    #[test]
    fn test_conditional_epig_shape_and_nonnegative() {
        let pool = random_logprobs(3, 5, 4);
        let targ = random_logprobs(2, 5, 4);
        let scores = conditional_epig_from_logprobs(pool, targ).unwrap();
        assert_eq!(scores.dims(), [3, 2]);
        for v in tensor_to_vec(scores) {
            assert!(v >= -1e-5, "negative EPIG {v}");
        }
    }

    #[test]
    fn test_conditional_epig_permutation_equivariant() {
        let device = Default::default();
        let pool = random_logprobs(4, 6, 3);
        let targ = random_logprobs(3, 6, 3);
        let p = indices_to_tensor::<TestBackend>(&[2, 0, 3, 1], &device);
        let q = indices_to_tensor::<TestBackend>(&[1, 2, 0], &device);

        let base = conditional_epig_from_logprobs(pool.clone(), targ.clone()).unwrap();
        let permuted = conditional_epig_from_logprobs(
            pool.select(0, p.clone()),
            targ.select(0, q.clone()),
        )
        .unwrap();
        let expected = base.select(0, p).select(1, q);

        let a = tensor_to_vec(permuted);
        let b = tensor_to_vec(expected);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
    }

    #[test]
    fn test_single_sample_gives_zero() {
        let pool = random_logprobs(5, 1, 4);
        let targ = random_logprobs(3, 1, 4);
        let epig = tensor_to_vec(epig_from_logprobs(pool, targ).unwrap());
        assert_eq!(epig.len(), 5);
        for v in epig {
            assert!(v.abs() < 1e-5, "K=1 should carry no information, got {v}");
        }
    }

    #[test]
    fn test_disagreeing_samples_carry_information() {
        // Two model samples that flip their prediction on both pool and target:
        // y and y* are perfectly correlated across samples.
        let device = Default::default();
        let sharp = |a: f32, b: f32| [a.ln(), b.ln()];
        let pool = Tensor::<TestBackend, 3>::from_data(
            TensorData::from([[sharp(0.99, 0.01), sharp(0.01, 0.99)]]),
            &device,
        );
        let targ = pool.clone();
        let epig = tensor_to_vec(epig_from_logprobs(pool, targ).unwrap());
        // Close to ln 2 for a perfectly correlated binary pair.
        assert!(epig[0] > 0.5, "got {}", epig[0]);
    }

    #[test]
    fn test_mismatched_sample_counts_rejected() {
        let pool = random_logprobs(2, 3, 4);
        let targ = random_logprobs(2, 4, 4);
        assert!(conditional_epig_from_logprobs(pool, targ).is_err());
    }

    #[test]
    fn test_conditional_predict_shape_and_normalized() {
        let device = Default::default();
        let net = AdaptNetConfig::new(4, 3)
            .with_d_hidden(8)
            .with_d_bottleneck(5)
            .init::<TestBackend>(&device);
        let feats = Tensor::<TestBackend, 2>::random([6, 5], Distribution::Normal(0.0, 1.0), &device);
        let lp = conditional_predict(&net, feats, 3, 4).unwrap();
        assert_eq!(lp.dims(), [6, 4, 3]);
        let sums = tensor_to_vec(lp.exp().sum_dim(2));
        for s in sums {
            assert!((s - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_conditional_predict_rejects_wrong_class_count() {
        let device = Default::default();
        let net = AdaptNetConfig::new(4, 3)
            .with_d_hidden(8)
            .with_d_bottleneck(5)
            .init::<TestBackend>(&device);
        let feats = Tensor::<TestBackend, 2>::zeros([2, 5], &device);
        assert!(conditional_predict(&net, feats.clone(), 4, 2).is_err());
        assert!(conditional_predict(&net, feats, 3, 0).is_err());
    }

    #[test]
    fn test_estimator_chunk_size_does_not_change_scores() {
        // Without dropout the passes are deterministic, so any difference
        // between chunkings would come from the chunking itself.
        let device = Default::default();
        let net = AdaptNetConfig::new(4, 3)
            .with_d_hidden(8)
            .with_d_bottleneck(5)
            .with_mc_dropout(0.0)
            .init::<TestBackend>(&device);
        let pool = Tensor::<TestBackend, 2>::random([7, 5], Distribution::Normal(0.0, 1.0), &device);
        let target = Tensor::<TestBackend, 2>::random([5, 5], Distribution::Normal(0.0, 1.0), &device);

        let whole = EpigEstimator {
            n_model_samples: 2,
            pool_chunk: 100,
            target_limit: 100,
            target_chunk: 100,
        };
        let chunked = EpigEstimator {
            pool_chunk: 3,
            target_chunk: 2,
            ..whole
        };
        let a = whole.estimate_epig(&net, pool.clone(), target.clone(), &device).unwrap();
        let b = chunked.estimate_epig(&net, pool, target, &device).unwrap();
        assert_eq!(a.len(), 7);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
    }

    #[test]
    fn test_estimator_accepts_host_rows() {
        let device = Default::default();
        let net = AdaptNetConfig::new(4, 2)
            .with_d_hidden(8)
            .with_d_bottleneck(3)
            .init::<TestBackend>(&device);
        let pool: Vec<Vec<f32>> = vec![vec![0.1, 0.2, 0.3], vec![1.0, -1.0, 0.5]];
        let target: Vec<Vec<f32>> = vec![vec![0.0, 0.0, 1.0]];
        let scores = EpigEstimator::default()
            .estimate_epig::<TestBackend, _>(&net, pool.as_slice(), target.as_slice(), &device)
            .unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_estimator_requires_targets() {
        let device = Default::default();
        let net = AdaptNetConfig::new(4, 2)
            .with_d_hidden(8)
            .with_d_bottleneck(3)
            .init::<TestBackend>(&device);
        let pool = Tensor::<TestBackend, 2>::zeros([2, 3], &device);
        let target = Tensor::<TestBackend, 2>::zeros([0, 3], &device);
        assert!(EpigEstimator::default()
            .estimate_epig(&net, pool, target, &device)
            .is_err());
    }
}

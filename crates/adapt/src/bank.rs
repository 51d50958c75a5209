//! Running per-sample banks addressed by global pool index.
//!
//! Four parallel banks share one index space:
//!
//! | bank | row | written by |
//! |---|---|---|
//! | features | L2-normalized bottleneck feature, `dim` floats | trainer step, warm-up |
//! | scores | softmax distribution, `num_classes` floats | trainer step, warm-up |
//! | energies | scalar free energy | trainer step, warm-up |
//! | similarities | mean similarity to the k nearest neighbors | trainer step |
//!
//! A write validates every index and row length before touching any bank,
//! so a rejected write leaves all four unchanged.

use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::cluster::l2_normalize;
use crate::error::{ensure_len, AdaptError, Result};
use crate::model::bridge::{flat_to_tensor, tensor_to_vec};
use crate::model::energy::energy;
use crate::model::network::{Backbone, Classifier};
use crate::pipeline::dataset::PoolBatch;

/// Feature, score, energy and similarity banks for the whole pool.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborBanks {
    features: Vec<f32>,
    scores: Vec<f32>,
    energies: Vec<f32>,
    similarities: Vec<f32>,
    len: usize,
    dim: usize,
    num_classes: usize,
}

impl NeighborBanks {
    /// Zero-initialized banks for `len` samples.
    pub fn new(len: usize, dim: usize, num_classes: usize) -> Self {
        Self {
            features: vec![0.0; len * dim],
            scores: vec![0.0; len * num_classes],
            energies: vec![0.0; len],
            similarities: vec![0.0; len],
            len,
            dim,
            num_classes,
        }
    }

    /// Fill fresh banks from one inference pass over the whole pool.
    ///
    /// Features are normalized, scores are softmax probabilities,
    /// similarities start at zero. The batches must cover every index in
    /// `0..len` exactly once.
    pub fn warm_up<B, M, I>(
        model: &M,
        batches: I,
        len: usize,
        norm_eps: f64,
    ) -> Result<Self>
    where
        B: Backend,
        M: Backbone<B> + Classifier<B>,
        I: IntoIterator<Item = PoolBatch<B>>,
    {
        let mut banks: Option<Self> = None;
        let mut filled = vec![false; len];

        for batch in batches {
            for &index in &batch.indices {
                if index >= len {
                    return Err(AdaptError::IndexOutOfRange { index, len });
                }
                if std::mem::replace(&mut filled[index], true) {
                    return Err(AdaptError::DuplicateIndex(index));
                }
            }

            let features = model.embed(batch.inputs);
            let logits = model.logits(features.clone(), false);
            let [_, dim] = features.dims();
            let [_, num_classes] = logits.dims();

            let banks = banks.get_or_insert_with(|| Self::new(len, dim, num_classes));
            banks.write_batch(
                &batch.indices,
                l2_normalize(features, norm_eps),
                softmax(logits.clone(), 1),
                energy(logits),
            )?;
        }

        let banks = banks.ok_or(AdaptError::EmptySelectionPool)?;
        let covered = filled.iter().filter(|&&f| f).count();
        ensure_len("warm_up: pool coverage", len, covered)?;
        tracing::info!(
            len,
            dim = banks.dim,
            num_classes = banks.num_classes,
            "Neighbor banks warmed up"
        );
        Ok(banks)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Feature dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn feature(&self, index: usize) -> Option<&[f32]> {
        (index < self.len).then(|| &self.features[index * self.dim..(index + 1) * self.dim])
    }

    pub fn score(&self, index: usize) -> Option<&[f32]> {
        (index < self.len)
            .then(|| &self.scores[index * self.num_classes..(index + 1) * self.num_classes])
    }

    pub fn energies(&self) -> &[f32] {
        &self.energies
    }

    /// Mean neighbor similarity per sample, consumed by the selection policy.
    pub fn similarities(&self) -> &[f32] {
        &self.similarities
    }

    /// Fail unless every index addresses a bank row.
    pub fn check_indices(&self, indices: &[usize]) -> Result<()> {
        match indices.iter().find(|&&i| i >= self.len) {
            Some(&index) => Err(AdaptError::IndexOutOfRange {
                index,
                len: self.len,
            }),
            None => Ok(()),
        }
    }

    /// Write feature, score and energy rows at `indices`, all or nothing.
    ///
    /// `features` and `scores` are row-major with one row per index.
    pub fn write(
        &mut self,
        indices: &[usize],
        features: &[f32],
        scores: &[f32],
        energies: &[f32],
    ) -> Result<()> {
        let n = indices.len();
        self.check_indices(indices)?;
        ensure_len("bank write: features", n * self.dim, features.len())?;
        ensure_len("bank write: scores", n * self.num_classes, scores.len())?;
        ensure_len("bank write: energies", n, energies.len())?;

        let (d, c) = (self.dim, self.num_classes);
        for (row, &index) in indices.iter().enumerate() {
            self.features[index * d..(index + 1) * d].copy_from_slice(&features[row * d..(row + 1) * d]);
            self.scores[index * c..(index + 1) * c].copy_from_slice(&scores[row * c..(row + 1) * c]);
            self.energies[index] = energies[row];
        }
        Ok(())
    }

    /// Tensor form of [`write`](Self::write).
    pub fn write_batch<B: Backend>(
        &mut self,
        indices: &[usize],
        features: Tensor<B, 2>,
        scores: Tensor<B, 2>,
        energies: Tensor<B, 1>,
    ) -> Result<()> {
        self.write(
            indices,
            &tensor_to_vec(features),
            &tensor_to_vec(scores),
            &tensor_to_vec(energies),
        )
    }

    /// Record mean neighbor similarities at `indices`.
    pub fn record_similarities(&mut self, indices: &[usize], similarities: &[f32]) -> Result<()> {
        self.check_indices(indices)?;
        ensure_len("record_similarities", indices.len(), similarities.len())?;
        for (&index, &sim) in indices.iter().zip(similarities) {
            self.similarities[index] = sim;
        }
        Ok(())
    }

    /// The whole feature bank as a `(len, dim)` tensor.
    pub fn feature_tensor<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B, 2>> {
        flat_to_tensor(&self.features, self.len, self.dim, device)
    }

    /// The whole score bank as a `(len, num_classes)` tensor.
    pub fn score_tensor<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B, 2>> {
        flat_to_tensor(&self.scores, self.len, self.num_classes, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    use crate::model::network::AdaptNetConfig;
    use crate::pipeline::dataset::PoolDataset;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_write_and_read_rows() {
        let mut banks = NeighborBanks::new(4, 2, 3);
        banks
            .write(
                &[2, 0],
                &[1.0, 0.0, 0.0, 1.0],
                &[0.2, 0.3, 0.5, 1.0, 0.0, 0.0],
                &[-1.0, -2.0],
            )
            .unwrap();
        assert_eq!(banks.feature(2).unwrap(), &[1.0, 0.0]);
        assert_eq!(banks.feature(0).unwrap(), &[0.0, 1.0]);
        assert_eq!(banks.score(2).unwrap(), &[0.2, 0.3, 0.5]);
        assert_eq!(banks.energies(), &[-2.0, 0.0, -1.0, 0.0]);
        assert!(banks.feature(4).is_none());
    }

    #[test]
    fn test_rejected_write_leaves_banks_untouched() {
        let mut banks = NeighborBanks::new(3, 1, 2);
        let before = banks.clone();
        let err = banks
            .write(&[0, 7], &[1.0, 1.0], &[0.5, 0.5, 0.5, 0.5], &[1.0, 1.0])
            .unwrap_err();
        assert!(matches!(err, AdaptError::IndexOutOfRange { index: 7, len: 3 }));
        assert_eq!(banks, before);

        // Wrong row length is rejected the same way.
        assert!(banks.write(&[0], &[1.0, 2.0], &[0.5, 0.5], &[1.0]).is_err());
        assert_eq!(banks, before);
    }

    #[test]
    fn test_record_similarities() {
        let mut banks = NeighborBanks::new(3, 1, 1);
        banks.record_similarities(&[1], &[0.75]).unwrap();
        assert_eq!(banks.similarities(), &[0.0, 0.75, 0.0]);
        assert!(banks.record_similarities(&[3], &[0.1]).is_err());
        assert!(banks.record_similarities(&[0, 1], &[0.1]).is_err());
    }

    #[test]
    fn test_warm_up_fills_every_row() {
        let device = Default::default();
        let net = AdaptNetConfig::new(3, 2)
            .with_d_hidden(8)
            .with_d_bottleneck(4)
            .init::<TestBackend>(&device);
        let inputs: Vec<f32> = (0..15).map(|i| i as f32 / 10.0).collect();
        let dataset = PoolDataset::new(inputs, vec![0, 1, 0, 1, 0], 3).unwrap();

        let banks = NeighborBanks::warm_up(
            &net,
            dataset.batches::<TestBackend>(2, &device).unwrap(),
            dataset.len(),
            1e-12,
        )
        .unwrap();

        assert_eq!(banks.len(), 5);
        assert_eq!(banks.dim(), 4);
        assert_eq!(banks.num_classes(), 2);
        for i in 0..5 {
            let s: f32 = banks.score(i).unwrap().iter().sum();
            assert!((s - 1.0).abs() < 1e-5);
            let norm: f32 = banks.feature(i).unwrap().iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!(norm < 1.0 + 1e-4);
        }
    }

    fn tiny_pool() -> (crate::model::network::AdaptNet<TestBackend>, PoolDataset) {
        let device = Default::default();
        let net = AdaptNetConfig::new(3, 2)
            .with_d_hidden(8)
            .with_d_bottleneck(4)
            .init::<TestBackend>(&device);
        let inputs: Vec<f32> = (0..15).map(|i| i as f32 / 10.0).collect();
        let dataset = PoolDataset::new(inputs, vec![0, 1, 0, 1, 0], 3).unwrap();
        (net, dataset)
    }

    #[test]
    fn test_warm_up_rejects_partial_coverage() {
        let device = Default::default();
        let (net, dataset) = tiny_pool();
        let err = NeighborBanks::warm_up(
            &net,
            dataset.batches::<TestBackend>(2, &device).unwrap().take(1),
            dataset.len(),
            1e-12,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AdaptError::ShapeMismatch {
                context: "warm_up: pool coverage",
                expected: 5,
                actual: 2,
            }
        ));
    }

    #[test]
    fn test_warm_up_rejects_duplicate_index() {
        let device = Default::default();
        let (net, dataset) = tiny_pool();
        let batches = dataset
            .batches::<TestBackend>(5, &device)
            .unwrap()
            .chain(dataset.batches::<TestBackend>(5, &device).unwrap().take(1));
        let err = NeighborBanks::warm_up(&net, batches, dataset.len(), 1e-12).unwrap_err();
        assert!(matches!(err, AdaptError::DuplicateIndex(0)));
    }
}

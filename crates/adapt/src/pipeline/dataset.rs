//! In-memory unlabeled pool with stable global indices.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::error::{ensure_len, AdaptError, Result};
use crate::model::bridge::flat_to_tensor;

/// One batch from the pool: raw inputs, ground-truth labels (evaluation and
/// oracle only) and the global index of every row.
#[derive(Debug, Clone)]
pub struct PoolBatch<B: Backend> {
    pub inputs: Tensor<B, 2>,
    pub labels: Vec<usize>,
    pub indices: Vec<usize>,
}

impl<B: Backend> PoolBatch<B> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Row-major pool of `len × dim` inputs with one label per row.
///
/// Row `i` has global index `i` for the lifetime of the pool.
#[derive(Debug, Clone)]
pub struct PoolDataset {
    inputs: Vec<f32>,
    labels: Vec<usize>,
    dim: usize,
}

impl PoolDataset {
    pub fn new(inputs: Vec<f32>, labels: Vec<usize>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(AdaptError::InvalidConfig("pool input dimension must be positive".to_string()));
        }
        ensure_len("PoolDataset: inputs", labels.len() * dim, inputs.len())?;
        Ok(Self { inputs, labels, dim })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Ground-truth labels indexed by global index.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn input(&self, index: usize) -> Option<&[f32]> {
        (index < self.len()).then(|| &self.inputs[index * self.dim..(index + 1) * self.dim])
    }

    /// Gather arbitrary rows into one batch.
    pub fn batch_of<B: Backend>(&self, indices: &[usize], device: &B::Device) -> Result<PoolBatch<B>> {
        let mut flat = Vec::with_capacity(indices.len() * self.dim);
        let mut labels = Vec::with_capacity(indices.len());
        for &index in indices {
            let row = self.input(index).ok_or(AdaptError::IndexOutOfRange {
                index,
                len: self.len(),
            })?;
            flat.extend_from_slice(row);
            labels.push(self.labels[index]);
        }
        Ok(PoolBatch {
            inputs: flat_to_tensor(&flat, indices.len(), self.dim, device)?,
            labels,
            indices: indices.to_vec(),
        })
    }

    /// Sequential batches in global index order; the last may be short.
    pub fn batches<'a, B: Backend>(
        &'a self,
        batch_size: usize,
        device: &'a B::Device,
    ) -> Result<impl Iterator<Item = PoolBatch<B>> + 'a> {
        let order: Vec<usize> = (0..self.len()).collect();
        self.batches_in_order(order, batch_size, device)
    }

    /// Batches over a random permutation of the pool.
    pub fn shuffled_batches<'a, B: Backend>(
        &'a self,
        batch_size: usize,
        rng: &mut StdRng,
        device: &'a B::Device,
    ) -> Result<impl Iterator<Item = PoolBatch<B>> + 'a> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        self.batches_in_order(order, batch_size, device)
    }

    fn batches_in_order<'a, B: Backend>(
        &'a self,
        order: Vec<usize>,
        batch_size: usize,
        device: &'a B::Device,
    ) -> Result<impl Iterator<Item = PoolBatch<B>> + 'a> {
        if batch_size == 0 {
            return Err(AdaptError::InvalidConfig("batch_size must be positive".to_string()));
        }
        let batches = order
            .chunks(batch_size)
            .map(|chunk| self.batch_of(chunk, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(batches.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use rand::SeedableRng;

    use crate::model::bridge::tensor_to_vec;

    type TestBackend = NdArray<f32>;

    fn pool() -> PoolDataset {
        let inputs: Vec<f32> = (0..10).map(|v| v as f32).collect();
        PoolDataset::new(inputs, vec![0, 1, 0, 1, 2], 2).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_shapes() {
        assert!(PoolDataset::new(vec![1.0; 5], vec![0, 1], 2).is_err());
        assert!(PoolDataset::new(vec![], vec![], 0).is_err());
    }

    #[test]
    fn test_sequential_batches() {
        let device = Default::default();
        let ds = pool();
        let batches: Vec<PoolBatch<TestBackend>> = ds.batches::<TestBackend>(2, &device).unwrap().collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].indices, vec![0, 1]);
        assert_eq!(batches[2].indices, vec![4]);
        assert_eq!(batches[2].labels, vec![2]);
        assert_eq!(tensor_to_vec(batches[1].inputs.clone()), vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_shuffled_batches_cover_pool_once() {
        let device = Default::default();
        let ds = pool();
        let mut rng = StdRng::seed_from_u64(3);
        let mut seen: Vec<usize> = ds
            .shuffled_batches::<TestBackend>(2, &mut rng, &device)
            .unwrap()
            .flat_map(|b| b.indices)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_batch_of_rows_follow_indices() {
        let device = Default::default();
        let batch = pool().batch_of::<TestBackend>(&[3, 0], &device).unwrap();
        assert_eq!(tensor_to_vec(batch.inputs), vec![6.0, 7.0, 0.0, 1.0]);
        assert_eq!(batch.labels, vec![1, 0]);
        assert!(pool().batch_of::<TestBackend>(&[5], &device).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let device = Default::default();
        assert!(pool().batches::<TestBackend>(0, &device).is_err());
    }

    #[test]
    fn test_bad_order_fails_instead_of_dropping_a_batch() {
        let device = Default::default();
        let ds = pool();
        let err = ds
            .batches_in_order::<TestBackend>(vec![0, 1, 9, 2], 2, &device)
            .map(|batches| batches.count())
            .unwrap_err();
        assert!(matches!(err, AdaptError::IndexOutOfRange { index: 9, len: 5 }));
    }
}

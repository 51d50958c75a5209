//! Accumulation of pseudo-labeled samples into fixed-size training batches.

use burn::prelude::*;

use crate::error::{ensure_len, AdaptError, Result};
use crate::pipeline::dataset::PoolBatch;

/// Outcome of one [`collect_data`] call.
#[derive(Debug, Clone)]
pub struct Collected<B: Backend> {
    /// Batch ready for training, when the threshold was reached.
    pub flushed: Option<PoolBatch<B>>,
    /// Samples carried to the next call.
    pub carry: Option<PoolBatch<B>>,
}

impl<B: Backend> Collected<B> {
    pub fn ready(&self) -> bool {
        self.flushed.is_some()
    }

    pub fn carry_len(&self) -> usize {
        self.carry.as_ref().map_or(0, PoolBatch::len)
    }
}

fn check(batch: &PoolBatch<impl Backend>) -> Result<()> {
    let rows = batch.inputs.dims()[0];
    ensure_len("collect_data: labels", rows, batch.labels.len())?;
    ensure_len("collect_data: indices", rows, batch.indices.len())
}

fn concat<B: Backend>(a: PoolBatch<B>, b: PoolBatch<B>) -> PoolBatch<B> {
    let mut labels = a.labels;
    labels.extend(b.labels);
    let mut indices = a.indices;
    indices.extend(b.indices);
    PoolBatch {
        inputs: Tensor::cat(vec![a.inputs, b.inputs], 0),
        labels,
        indices,
    }
}

/// Split rows `[0, at)` from `[at, len)`. Empty halves come back as `None`
/// since burn rejects empty slice ranges.
fn split<B: Backend>(batch: PoolBatch<B>, at: usize) -> (Option<PoolBatch<B>>, Option<PoolBatch<B>>) {
    let [rows, dim] = batch.inputs.dims();
    if at == 0 {
        return (None, Some(batch));
    }
    if at >= rows {
        return (Some(batch), None);
    }
    let head = PoolBatch {
        inputs: batch.inputs.clone().slice([0..at, 0..dim]),
        labels: batch.labels[..at].to_vec(),
        indices: batch.indices[..at].to_vec(),
    };
    let tail = PoolBatch {
        inputs: batch.inputs.slice([at..rows, 0..dim]),
        labels: batch.labels[at..].to_vec(),
        indices: batch.indices[at..].to_vec(),
    };
    (Some(head), Some(tail))
}

/// Merge `new` into `pending` and flush once `batch_size` is reached.
///
/// - `pending + new >= batch_size`, `pending` empty: all of `new` is flushed.
/// - `pending + new >= batch_size` otherwise: `pending ++ new[..split]` is
///   flushed with `split = batch_size - pending`, `new[split..]` is carried.
/// - below the threshold: nothing is flushed, `pending ++ new` is carried.
///
/// A pending batch already at or above `batch_size` is flushed whole and
/// all of `new` is carried.
pub fn collect_data<B: Backend>(
    pending: Option<PoolBatch<B>>,
    new: PoolBatch<B>,
    batch_size: usize,
) -> Result<Collected<B>> {
    if batch_size == 0 {
        return Err(AdaptError::InvalidConfig("batch_size must be positive".to_string()));
    }
    check(&new)?;
    let pending = match pending {
        Some(p) if !p.is_empty() => {
            check(&p)?;
            ensure_len("collect_data: input dim", p.inputs.dims()[1], new.inputs.dims()[1])?;
            Some(p)
        }
        _ => None,
    };
    let pending_len = pending.as_ref().map_or(0, PoolBatch::len);
    let new = (!new.is_empty()).then_some(new);
    let new_len = new.as_ref().map_or(0, PoolBatch::len);

    if pending_len + new_len < batch_size {
        let carry = match (pending, new) {
            (Some(p), Some(n)) => Some(concat(p, n)),
            (p, n) => p.or(n),
        };
        return Ok(Collected {
            flushed: None,
            carry,
        });
    }

    match (pending, new) {
        (Some(p), Some(n)) => {
            let (head, tail) = split(n, batch_size.saturating_sub(pending_len));
            Ok(Collected {
                flushed: Some(match head {
                    Some(head) => concat(p, head),
                    None => p,
                }),
                carry: tail,
            })
        }
        (p, n) => Ok(Collected {
            flushed: p.or(n),
            carry: None,
        }),
    }
}

/// Owned pending state around [`collect_data`].
#[derive(Debug)]
pub struct PredictionBuffer<B: Backend> {
    pending: Option<PoolBatch<B>>,
    batch_size: usize,
}

impl<B: Backend> PredictionBuffer<B> {
    pub fn new(batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(AdaptError::InvalidConfig("batch_size must be positive".to_string()));
        }
        Ok(Self {
            pending: None,
            batch_size,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, PoolBatch::len)
    }

    /// Add samples; returns a training batch once the threshold is reached.
    pub fn push(&mut self, batch: PoolBatch<B>) -> Result<Option<PoolBatch<B>>> {
        let collected = collect_data(self.pending.take(), batch, self.batch_size)?;
        self.pending = collected.carry;
        Ok(collected.flushed)
    }

    /// Take whatever is pending, leaving the buffer empty.
    pub fn drain(&mut self) -> Option<PoolBatch<B>> {
        self.pending.take()
    }
}

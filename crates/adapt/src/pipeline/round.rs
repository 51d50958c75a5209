//! One labeling round: pool inference, thresholds, selection, clustering
//! refinement and oracle override.

use std::io::Write;

use burn::prelude::*;
use burn::tensor::activation::softmax;
use serde::Serialize;

use crate::cluster::{apply_oracle_labels, downweight_unknown, prepare_features, ClusteringRefiner};
use crate::error::{ensure_len, AdaptError, Result};
use crate::information::EpigEstimator;
use crate::model::bridge::{flat_to_tensor, int_tensor_to_indices, tensor_to_vec};
use crate::model::energy::energy;
use crate::model::network::{Backbone, Classifier};
use crate::pipeline::dataset::PoolBatch;
use crate::selection::{energy_thresholds, EnergyThresholds, SelectionLedger, SelectionPolicy};

/// Round-level knobs that are not owned by a component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundSettings {
    /// Fraction of the energy distribution treated as confident (`percen`).
    pub percen: f64,
    /// Fraction of the distribution above the unknown threshold.
    pub unknown_fraction: f64,
    /// Feature weight applied to likely-unknown samples before clustering.
    pub ood_factor: f32,
    /// Lower bound on feature norms when preparing features.
    pub feature_eps: f64,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            percen: 0.5,
            unknown_fraction: 0.2,
            ood_factor: 0.1,
            feature_eps: 1e-8,
        }
    }
}

/// Accuracies (percent) and counts reported by one round.
///
/// Accuracies over an empty subset are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoundMetrics {
    /// Plain classifier accuracy before refinement.
    pub accuracy: Option<f64>,
    pub confident_count: usize,
    pub confident_accuracy: Option<f64>,
    pub unknown_count: usize,
    pub unknown_accuracy: Option<f64>,
    /// Accuracy of the clustering labels before the oracle override.
    pub clustering_accuracy: Option<f64>,
    /// Clustering accuracy on this round's selection (lower means the
    /// selection targeted mistakes).
    pub selected_clustering_accuracy: Option<f64>,
    /// Accuracy of the returned pseudo-labels over the whole pool.
    pub final_accuracy: Option<f64>,
    /// Accuracy of the returned pseudo-labels over the confident set.
    pub returned_accuracy: Option<f64>,
    pub newly_labeled: usize,
    pub previously_labeled: usize,
    pub ledger_size: usize,
}

/// Everything a labeling round hands back to the driver.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    /// Refined label for every pool sample, by global index.
    pub pseudo_labels: Vec<usize>,
    /// Energies after the oracle override, by global index.
    pub energies: Vec<f32>,
    /// Indices whose pseudo-labels are trusted for training.
    pub confident: Vec<usize>,
    /// Indices selected for oracle labeling this round.
    pub newly_labeled: Vec<usize>,
    pub thresholds: EnergyThresholds,
    pub metrics: RoundMetrics,
}

/// Percentage of `rows` where `predicted == truth`.
fn accuracy_over(
    rows: impl IntoIterator<Item = usize>,
    predicted: &[usize],
    truth: &[usize],
) -> (usize, Option<f64>) {
    let (mut total, mut hits) = (0usize, 0usize);
    for i in rows {
        total += 1;
        hits += usize::from(predicted[i] == truth[i]);
    }
    let acc = (total > 0).then(|| hits as f64 / total as f64 * 100.0);
    (total, acc)
}

fn fmt_pct(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}%"))
}

/// Pool inference results placed by global index.
struct PoolView<B: Backend> {
    features: Tensor<B, 2>,
    logits: Tensor<B, 2>,
    energies: Vec<f32>,
    truth: Vec<usize>,
    device: B::Device,
}

fn infer_pool<B, M, I>(model: &M, batches: I, len: usize) -> Result<PoolView<B>>
where
    B: Backend,
    M: Backbone<B> + Classifier<B>,
    I: IntoIterator<Item = PoolBatch<B>>,
{
    let num_classes = model.num_classes();
    let mut features: Vec<f32> = Vec::new();
    let mut logits = vec![0.0_f32; len * num_classes];
    let mut energies = vec![0.0_f32; len];
    let mut truth = vec![0usize; len];
    let mut filled = vec![false; len];
    let mut dim = 0usize;
    let mut device: Option<B::Device> = None;

    for batch in batches {
        if batch.is_empty() {
            continue;
        }
        let PoolBatch {
            inputs,
            labels,
            indices,
        } = batch;
        ensure_len("obtain_labels: batch labels", indices.len(), labels.len())?;
        device.get_or_insert_with(|| inputs.device());

        let feats = model.embed(inputs);
        let batch_logits = model.logits(feats.clone(), false);
        let batch_energies = tensor_to_vec(energy(batch_logits.clone()));
        let batch_dim = feats.dims()[1];
        ensure_len("obtain_labels: classes", num_classes, batch_logits.dims()[1])?;
        if dim == 0 {
            dim = batch_dim;
            features = vec![0.0; len * dim];
        }
        ensure_len("obtain_labels: feature dim", dim, batch_dim)?;
        let feats = tensor_to_vec(feats);
        let batch_logits = tensor_to_vec(batch_logits);

        for (row, &index) in indices.iter().enumerate() {
            if index >= len {
                return Err(AdaptError::IndexOutOfRange { index, len });
            }
            if std::mem::replace(&mut filled[index], true) {
                return Err(AdaptError::DuplicateIndex(index));
            }
            features[index * dim..(index + 1) * dim].copy_from_slice(&feats[row * dim..(row + 1) * dim]);
            logits[index * num_classes..(index + 1) * num_classes]
                .copy_from_slice(&batch_logits[row * num_classes..(row + 1) * num_classes]);
            energies[index] = batch_energies[row];
            truth[index] = labels[row];
        }
    }

    let covered = filled.iter().filter(|&&f| f).count();
    ensure_len("obtain_labels: pool coverage", len, covered)?;
    let device = device.ok_or(AdaptError::EmptySelectionPool)?;
    Ok(PoolView {
        features: flat_to_tensor(&features, len, dim, &device)?,
        logits: flat_to_tensor(&logits, len, num_classes, &device)?,
        energies,
        truth,
        device,
    })
}

/// Owns the run-wide ledger and the components of a labeling round.
#[derive(Debug, Clone)]
pub struct RoundOrchestrator {
    policy: SelectionPolicy,
    refiner: ClusteringRefiner,
    estimator: EpigEstimator,
    settings: RoundSettings,
    ledger: SelectionLedger,
    rounds: usize,
}

impl RoundOrchestrator {
    pub fn new(
        policy: SelectionPolicy,
        refiner: ClusteringRefiner,
        estimator: EpigEstimator,
        settings: RoundSettings,
    ) -> Self {
        Self {
            policy,
            refiner,
            estimator,
            settings,
            ledger: SelectionLedger::new(),
            rounds: 0,
        }
    }

    /// Every index selected so far, in selection order.
    pub fn ledger(&self) -> &SelectionLedger {
        &self.ledger
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    pub fn settings(&self) -> &RoundSettings {
        &self.settings
    }

    /// Rounds completed so far.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Run one labeling round over the whole pool.
    ///
    /// # Arguments
    /// - `model`: inference model; stochastic passes are only drawn for
    ///   information-gain selection
    /// - `batches`: every pool sample exactly once, with global indices
    /// - `similarities`: similarity bank, one entry per pool sample
    /// - `budget`: oracle labels to request this round
    /// - `last`: on the final round every negative-energy sample is confident
    /// - `log`: receives the `Accuracy = a% -> b%` line
    pub fn obtain_labels<B, M, I>(
        &mut self,
        model: &M,
        batches: I,
        similarities: &[f32],
        budget: usize,
        last: bool,
        log: &mut dyn Write,
    ) -> Result<RoundOutcome>
    where
        B: Backend,
        M: Backbone<B> + Classifier<B>,
        I: IntoIterator<Item = PoolBatch<B>>,
    {
        let n = similarities.len();
        if n == 0 {
            return Err(AdaptError::EmptySelectionPool);
        }
        let PoolView {
            features,
            logits,
            mut energies,
            truth,
            device,
        } = infer_pool(model, batches, n)?;

        let probs = softmax(logits, 1);
        let predict = int_tensor_to_indices(probs.clone().argmax(1));
        let (_, accuracy) = accuracy_over(0..n, &predict, &truth);

        let thresholds = energy_thresholds(&energies, self.settings.percen, self.settings.unknown_fraction)?;
        let (confident_count, confident_accuracy) = accuracy_over(
            (0..n).filter(|&i| energies[i] < thresholds.confident),
            &predict,
            &truth,
        );
        let (unknown_count, unknown_accuracy) = accuracy_over(
            (0..n).filter(|&i| energies[i] > thresholds.unknown),
            &predict,
            &truth,
        );
        tracing::debug!(
            confident_count,
            confident_accuracy = ?confident_accuracy,
            unknown_count,
            unknown_accuracy = ?unknown_accuracy,
            "Energy thresholds"
        );

        let information_gain = if self.policy.requires_information_gain() {
            Some(
                self.estimator
                    .estimate_epig(model, features.clone(), features.clone(), &device)?,
            )
        } else {
            None
        };
        let selection = self.policy.select(
            &energies,
            similarities,
            information_gain.as_deref(),
            budget,
            &mut self.ledger,
        )?;

        let prepared = prepare_features(features, self.settings.feature_eps);
        let weighted = downweight_unknown(prepared, &energies, thresholds.unknown, self.settings.ood_factor)?;
        let mut pseudo_labels = self.refiner.refine(probs, weighted, &predict)?;

        let (_, clustering_accuracy) = accuracy_over(0..n, &pseudo_labels, &truth);
        let (_, selected_clustering_accuracy) =
            accuracy_over(selection.indices.iter().copied(), &pseudo_labels, &truth);
        if let Some(acc) = selected_clustering_accuracy {
            tracing::info!(
                selected = selection.indices.len(),
                "Clustering accuracy on selected samples: {acc:.2}% (lower is better)"
            );
        }

        apply_oracle_labels(&mut pseudo_labels, &mut energies, &self.ledger, &truth)?;
        let (_, final_accuracy) = accuracy_over(0..n, &pseudo_labels, &truth);

        let confident: Vec<usize> = if last {
            (0..n).filter(|&i| energies[i] < 0.0).collect()
        } else {
            (0..n).filter(|&i| energies[i] < thresholds.confident).collect()
        };
        let (_, returned_accuracy) = accuracy_over(confident.iter().copied(), &pseudo_labels, &truth);

        writeln!(
            log,
            "Accuracy = {:.2}% -> {:.2}%",
            accuracy.unwrap_or(0.0),
            final_accuracy.unwrap_or(0.0)
        )?;
        log.flush()?;

        self.rounds += 1;
        let metrics = RoundMetrics {
            accuracy,
            confident_count,
            confident_accuracy,
            unknown_count,
            unknown_accuracy,
            clustering_accuracy,
            selected_clustering_accuracy,
            final_accuracy,
            returned_accuracy,
            newly_labeled: selection.indices.len(),
            previously_labeled: selection.previously_labeled,
            ledger_size: self.ledger.len(),
        };
        tracing::info!(
            round = self.rounds,
            accuracy = %fmt_pct(accuracy),
            clustering = %fmt_pct(clustering_accuracy),
            final_accuracy = %fmt_pct(final_accuracy),
            returned = %fmt_pct(returned_accuracy),
            confident = confident.len(),
            ledger_size = self.ledger.len(),
            last,
            "Labeling round complete"
        );

        Ok(RoundOutcome {
            pseudo_labels,
            energies,
            confident,
            newly_labeled: selection.indices,
            thresholds,
            metrics,
        })
    }
}

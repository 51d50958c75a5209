//! Run configuration loaded from TOML.
//!
//! Every field has a serde default, so any subset of sections and keys may
//! be given. [`AdaptConfig::validate`] rejects values no component accepts.

use serde::{Deserialize, Serialize};

use crate::cluster::ClusteringRefiner;
use crate::error::{AdaptError, Result};
use crate::information::EpigEstimator;
use crate::model::network::AdaptNetConfig;
use crate::pipeline::round::{RoundOrchestrator, RoundSettings};
use crate::selection::{SelectionMode, SelectionPolicy};
use crate::training::trainer::NeighborConfig;

/// Whole-run configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdaptConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub neighbors: NeighborConfig,
    #[serde(default)]
    pub information_gain: InformationGainConfig,
}

/// `[run]`: round schedule and batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Labeling rounds; the last one uses the `energy < 0` confident set.
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    /// Training batch size, also the prediction buffer threshold.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Oracle labels requested per round.
    #[serde(default = "default_budget")]
    pub budget: usize,
    /// Seed for data generation, shuffling and random selection.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Supervised steps on the source domain before adaptation.
    #[serde(default = "default_source_steps")]
    pub source_steps: usize,
    /// Learning rate for source training.
    #[serde(default = "default_source_lr")]
    pub source_lr: f64,
}

fn default_rounds() -> usize {
    3
}
fn default_batch_size() -> usize {
    64
}
fn default_budget() -> usize {
    10
}
fn default_source_steps() -> usize {
    200
}
fn default_source_lr() -> f64 {
    1e-2
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            batch_size: default_batch_size(),
            budget: default_budget(),
            seed: None,
            source_steps: default_source_steps(),
            source_lr: default_source_lr(),
        }
    }
}

/// `[pool]`: synthetic Gaussian-blob pool with a source/target shift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Unlabeled target samples.
    #[serde(default = "default_pool_size")]
    pub size: usize,
    #[serde(default = "default_input_dim")]
    pub input_dim: usize,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Distance between class means.
    #[serde(default = "default_separation")]
    pub separation: f32,
    /// Per-coordinate noise standard deviation.
    #[serde(default = "default_noise")]
    pub noise: f32,
    /// Offset added to every target sample.
    #[serde(default = "default_shift")]
    pub shift: f32,
}

fn default_pool_size() -> usize {
    600
}
fn default_input_dim() -> usize {
    16
}
fn default_num_classes() -> usize {
    4
}
fn default_separation() -> f32 {
    4.0
}
fn default_noise() -> f32 {
    1.0
}
fn default_shift() -> f32 {
    1.5
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            input_dim: default_input_dim(),
            num_classes: default_num_classes(),
            separation: default_separation(),
            noise: default_noise(),
            shift: default_shift(),
        }
    }
}

/// `[model]`: reference network sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_d_hidden")]
    pub d_hidden: usize,
    #[serde(default = "default_d_bottleneck")]
    pub d_bottleneck: usize,
    /// Drop probability of the Monte-Carlo dropout.
    #[serde(default = "default_mc_dropout")]
    pub mc_dropout: f64,
}

fn default_d_hidden() -> usize {
    64
}
fn default_d_bottleneck() -> usize {
    32
}
fn default_mc_dropout() -> f64 {
    0.5
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_hidden: default_d_hidden(),
            d_bottleneck: default_d_bottleneck(),
            mc_dropout: default_mc_dropout(),
        }
    }
}

/// `[selection]`: ranking mode and energy thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    #[serde(default)]
    pub mode: SelectionMode,
    /// Highest-energy fraction kept as candidates.
    #[serde(default = "default_candidate_fraction")]
    pub candidate_fraction: f64,
    /// Fraction of the energy distribution treated as confident.
    #[serde(default = "default_percen")]
    pub percen: f64,
    /// Position of the unknown threshold in the descending distribution.
    #[serde(default = "default_unknown_fraction")]
    pub unknown_fraction: f64,
}

fn default_candidate_fraction() -> f64 {
    0.07
}
fn default_percen() -> f64 {
    0.5
}
fn default_unknown_fraction() -> f64 {
    0.2
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            mode: SelectionMode::default(),
            candidate_fraction: default_candidate_fraction(),
            percen: default_percen(),
            unknown_fraction: default_unknown_fraction(),
        }
    }
}

/// `[clustering]`: refinement rounds and feature weighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default = "default_extra_rounds")]
    pub extra_rounds: usize,
    /// Weight of likely-unknown features.
    #[serde(default = "default_ood_factor")]
    pub ood_factor: f32,
    #[serde(default = "default_cluster_eps")]
    pub eps: f64,
}

fn default_extra_rounds() -> usize {
    1
}
fn default_ood_factor() -> f32 {
    0.1
}
fn default_cluster_eps() -> f64 {
    1e-8
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            extra_rounds: default_extra_rounds(),
            ood_factor: default_ood_factor(),
            eps: default_cluster_eps(),
        }
    }
}

/// `[information_gain]`: EPIG sampling and chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformationGainConfig {
    #[serde(default = "default_n_model_samples")]
    pub n_model_samples: usize,
    #[serde(default = "default_pool_chunk")]
    pub pool_chunk: usize,
    #[serde(default = "default_target_limit")]
    pub target_limit: usize,
    #[serde(default = "default_target_chunk")]
    pub target_chunk: usize,
}

fn default_n_model_samples() -> usize {
    4
}
fn default_pool_chunk() -> usize {
    100
}
fn default_target_limit() -> usize {
    10_000
}
fn default_target_chunk() -> usize {
    1_000
}

impl Default for InformationGainConfig {
    fn default() -> Self {
        Self {
            n_model_samples: default_n_model_samples(),
            pool_chunk: default_pool_chunk(),
            target_limit: default_target_limit(),
            target_chunk: default_target_chunk(),
        }
    }
}

fn in_unit_interval(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(AdaptError::InvalidConfig(format!("{name} must lie in [0, 1], got {value}")))
    }
}

fn positive(name: &str, value: usize) -> Result<()> {
    if value > 0 {
        Ok(())
    } else {
        Err(AdaptError::InvalidConfig(format!("{name} must be positive")))
    }
}

impl AdaptConfig {
    /// Reject impossible values; warn about legal but suspicious ones.
    pub fn validate(&self) -> Result<()> {
        positive("run.batch_size", self.run.batch_size)?;
        positive("pool.size", self.pool.size)?;
        positive("pool.input_dim", self.pool.input_dim)?;
        positive("pool.num_classes", self.pool.num_classes)?;
        positive("model.d_hidden", self.model.d_hidden)?;
        positive("model.d_bottleneck", self.model.d_bottleneck)?;
        if !(0.0..1.0).contains(&self.model.mc_dropout) {
            return Err(AdaptError::InvalidConfig(format!(
                "model.mc_dropout must lie in [0, 1), got {}",
                self.model.mc_dropout
            )));
        }
        in_unit_interval("selection.candidate_fraction", self.selection.candidate_fraction)?;
        in_unit_interval("selection.percen", self.selection.percen)?;
        in_unit_interval("selection.unknown_fraction", self.selection.unknown_fraction)?;
        self.neighbors.validate()?;
        if self.neighbors.k + 1 > self.pool.size || self.neighbors.m + 1 > self.pool.size {
            return Err(AdaptError::InvalidConfig(format!(
                "pool of {} samples is too small for k={} / m={} neighbors",
                self.pool.size, self.neighbors.k, self.neighbors.m
            )));
        }
        let ig = &self.information_gain;
        positive("information_gain.n_model_samples", ig.n_model_samples)?;
        positive("information_gain.pool_chunk", ig.pool_chunk)?;
        positive("information_gain.target_limit", ig.target_limit)?;
        positive("information_gain.target_chunk", ig.target_chunk)?;

        if self.run.budget == 0 {
            tracing::warn!("run.budget = 0: no samples will be sent to the oracle");
        }
        let candidates = (self.selection.candidate_fraction * self.pool.size as f64) as usize;
        if self.selection.mode == SelectionMode::EnergyDiversity && candidates < self.run.budget {
            tracing::warn!(
                candidates,
                budget = self.run.budget,
                "Candidate set is smaller than the per-round budget; rounds will under-fill"
            );
        }
        if self.selection.mode == SelectionMode::InformationGain && self.model.mc_dropout == 0.0 {
            tracing::warn!("information_gain selection with mc_dropout = 0 scores every sample as zero");
        }
        Ok(())
    }

    pub fn network_config(&self) -> AdaptNetConfig {
        AdaptNetConfig::new(self.pool.input_dim, self.pool.num_classes)
            .with_d_hidden(self.model.d_hidden)
            .with_d_bottleneck(self.model.d_bottleneck)
            .with_mc_dropout(self.model.mc_dropout)
    }

    pub fn selection_policy(&self) -> Result<SelectionPolicy> {
        SelectionPolicy::new(
            self.selection.mode,
            self.selection.candidate_fraction,
            self.run.seed,
        )
    }

    pub fn refiner(&self) -> ClusteringRefiner {
        ClusteringRefiner {
            extra_rounds: self.clustering.extra_rounds,
            eps: self.clustering.eps,
        }
    }

    pub fn estimator(&self) -> EpigEstimator {
        let ig = &self.information_gain;
        EpigEstimator {
            n_model_samples: ig.n_model_samples,
            pool_chunk: ig.pool_chunk,
            target_limit: ig.target_limit,
            target_chunk: ig.target_chunk,
        }
    }

    pub fn round_settings(&self) -> RoundSettings {
        RoundSettings {
            percen: self.selection.percen,
            unknown_fraction: self.selection.unknown_fraction,
            ood_factor: self.clustering.ood_factor,
            feature_eps: self.clustering.eps,
        }
    }

    /// Orchestrator with a fresh ledger, built from every section.
    pub fn orchestrator(&self) -> Result<RoundOrchestrator> {
        Ok(RoundOrchestrator::new(
            self.selection_policy()?,
            self.refiner(),
            self.estimator(),
            self.round_settings(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cfg = AdaptConfig::default();
        assert_eq!(cfg.run.rounds, 3);
        assert_eq!(cfg.run.batch_size, 64);
        assert_eq!(cfg.run.seed, None);
        assert_eq!(cfg.selection.mode, SelectionMode::EnergyDiversity);
        assert!((cfg.selection.candidate_fraction - 0.07).abs() < 1e-12);
        assert!((cfg.selection.percen - 0.5).abs() < 1e-12);
        assert_eq!(cfg.clustering.extra_rounds, 1);
        assert_eq!(cfg.neighbors.k, 5);
        assert_eq!(cfg.information_gain.pool_chunk, 100);
        assert_eq!(cfg.information_gain.target_limit, 10_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_override() {
        let toml_str = r#"
            [run]
            rounds = 5
            seed = 42

            [selection]
            mode = "information_gain"

            [neighbors]
            k = 3
        "#;
        let cfg: AdaptConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.run.rounds, 5);
        assert_eq!(cfg.run.seed, Some(42));
        assert_eq!(cfg.selection.mode, SelectionMode::InformationGain);
        assert_eq!(cfg.neighbors.k, 3);
        // Defaults for unspecified fields
        assert_eq!(cfg.run.batch_size, 64);
        assert_eq!(cfg.neighbors.m, 5);
        assert!((cfg.selection.percen - 0.5).abs() < 1e-12);
        assert_eq!(cfg.pool, PoolConfig::default());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let cfg: AdaptConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, AdaptConfig::default());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let toml_str = r#"
            [selection]
            mode = "bald"
        "#;
        assert!(toml::from_str::<AdaptConfig>(toml_str).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let mut cfg = AdaptConfig::default();
        cfg.selection.percen = 1.5;
        assert!(matches!(cfg.validate(), Err(AdaptError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut cfg = AdaptConfig::default();
        cfg.run.batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_pool() {
        let mut cfg = AdaptConfig::default();
        cfg.pool.size = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_builders_follow_sections() {
        let mut cfg = AdaptConfig::default();
        cfg.clustering.extra_rounds = 4;
        cfg.information_gain.n_model_samples = 8;
        cfg.selection.mode = SelectionMode::Random;
        cfg.run.seed = Some(1);
        assert_eq!(cfg.refiner().extra_rounds, 4);
        assert_eq!(cfg.estimator().n_model_samples, 8);
        assert_eq!(cfg.selection_policy().unwrap().mode(), SelectionMode::Random);
        assert_eq!(cfg.network_config().num_classes, cfg.pool.num_classes);
        assert!((cfg.round_settings().ood_factor - 0.1).abs() < 1e-6);
        assert!(cfg.orchestrator().unwrap().ledger().is_empty());
    }
}

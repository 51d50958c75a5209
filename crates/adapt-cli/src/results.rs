//! Result types for adaptation runs.

use std::path::Path;

use adapt::pipeline::RoundOutcome;
use adapt::training::StepMetrics;
use serde::{Deserialize, Serialize};

/// Summary of one labeling round and the training that followed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundReport {
    /// 1-based round number.
    pub round: usize,
    /// Whether this round used the `energy < 0` confident set.
    pub last: bool,
    /// Oracle-labeled indices selected this round.
    pub newly_labeled: Vec<usize>,
    /// Confident samples used for training.
    pub confident: usize,
    /// Energy threshold below which samples count as confident.
    pub confident_threshold: f32,
    /// Energy threshold above which samples count as likely unknown.
    pub unknown_threshold: f32,
    /// Accuracy of the plain classifier (percent).
    pub accuracy: Option<f64>,
    /// Accuracy of the refined pseudo-labels (percent).
    pub final_accuracy: Option<f64>,
    /// Clustering accuracy on the selected samples (percent).
    pub selected_clustering_accuracy: Option<f64>,
    /// Training steps run on this round's confident samples.
    pub train_steps: usize,
    /// Mean step metrics over those steps.
    pub train: Option<StepMetrics>,
}

impl RoundReport {
    pub fn from_outcome(
        round: usize,
        last: bool,
        outcome: &RoundOutcome,
        train_steps: usize,
        train: Option<StepMetrics>,
    ) -> Self {
        Self {
            round,
            last,
            newly_labeled: outcome.newly_labeled.clone(),
            confident: outcome.confident.len(),
            confident_threshold: outcome.thresholds.confident,
            unknown_threshold: outcome.thresholds.unknown,
            accuracy: outcome.metrics.accuracy,
            final_accuracy: outcome.metrics.final_accuracy,
            selected_clustering_accuracy: outcome.metrics.selected_clustering_accuracy,
            train_steps,
            train,
        }
    }
}

/// Whole-run summary written by `run --json` / `--output`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Selection mode name.
    pub mode: String,
    pub seed: Option<u64>,
    pub pool_size: usize,
    pub budget: usize,
    /// Target-pool accuracy of the source model before adaptation (percent).
    pub source_accuracy: f64,
    /// Target-pool accuracy after the final round (percent).
    pub adapted_accuracy: f64,
    /// Oracle labels spent over the whole run.
    pub labeled: usize,
    pub rounds: Vec<RoundReport>,
    pub elapsed_secs: f64,
}

impl RunReport {
    /// Write pretty-printed JSON.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Wrote run report");
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use adapt::pipeline::RoundMetrics;
    use adapt::selection::EnergyThresholds;

    fn report() -> RunReport {
        let outcome = RoundOutcome {
            pseudo_labels: vec![0; 100],
            energies: vec![0.0; 100],
            confident: (0..40).collect(),
            newly_labeled: vec![4, 9, 17, 30, 2],
            thresholds: EnergyThresholds {
                confident: -1.5,
                unknown: 0.25,
            },
            metrics: RoundMetrics {
                accuracy: Some(70.0),
                final_accuracy: Some(82.5),
                selected_clustering_accuracy: None,
                ..RoundMetrics::default()
            },
        };
        RunReport {
            mode: "energy_diversity".to_string(),
            seed: Some(3),
            pool_size: 100,
            budget: 5,
            source_accuracy: 70.0,
            adapted_accuracy: 88.0,
            labeled: 5,
            rounds: vec![RoundReport::from_outcome(1, true, &outcome, 3, Some(StepMetrics::default()))],
            elapsed_secs: 1.25,
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report().save(&path).unwrap();

        let loaded = RunReport::load(&path).unwrap();
        assert_eq!(loaded.rounds.len(), 1);
        assert_eq!(loaded.rounds[0].newly_labeled, vec![4, 9, 17, 30, 2]);
        assert_eq!(loaded.rounds[0].final_accuracy, Some(82.5));
        assert_eq!(loaded.rounds[0].selected_clustering_accuracy, None);
        assert!((loaded.adapted_accuracy - 88.0).abs() < 1e-9);
    }

    #[test]
    fn test_report_json_fields() {
        let value = serde_json::to_value(report()).unwrap();
        assert_eq!(value["mode"], "energy_diversity");
        assert_eq!(value["rounds"][0]["confident"], 40);
        assert_eq!(value["rounds"][0]["train"]["loss"], 0.0);
    }
}

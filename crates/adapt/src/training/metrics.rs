use serde::{Deserialize, Serialize};

/// Per-step training metrics with health checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Total loss: first order + second order + diversity.
    pub loss: f64,
    /// Weighted agreement with the K nearest neighbors.
    pub first_order: f64,
    /// Weighted agreement with the neighbors' M nearest neighbors.
    pub second_order: f64,
    /// Mean-prediction term `Σ p̄ log p̄`.
    pub diversity: f64,
    /// Mean similarity between batch samples and their K nearest neighbors.
    pub mean_similarity: f64,
}

impl StepMetrics {
    /// Warnings for degenerate training states. Empty when healthy.
    pub fn health_check(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.loss.is_finite() {
            warnings.push(format!("non-finite loss: {}", self.loss));
        }
        if self.mean_similarity > 0.999 {
            warnings.push(format!(
                "features collapsing: mean neighbor similarity {:.4}",
                self.mean_similarity
            ));
        }
        if self.diversity > -0.05 {
            warnings.push(format!(
                "batch predictions collapsed onto one class: diversity {:.4}",
                self.diversity
            ));
        }
        warnings
    }
}

/// Running average of [`StepMetrics`] over a logging interval.
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    sum: StepMetrics,
    count: usize,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, m: &StepMetrics) {
        self.sum.loss += m.loss;
        self.sum.first_order += m.first_order;
        self.sum.second_order += m.second_order;
        self.sum.diversity += m.diversity;
        self.sum.mean_similarity += m.mean_similarity;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Averaged metrics, or `None` before the first update.
    pub fn average(&self) -> Option<StepMetrics> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(StepMetrics {
            loss: self.sum.loss / n,
            first_order: self.sum.first_order / n,
            second_order: self.sum.second_order / n,
            diversity: self.sum.diversity / n,
            mean_similarity: self.sum.mean_similarity / n,
        })
    }

    pub fn display(&self) -> String {
        match self.average() {
            None => "no data".to_string(),
            Some(m) => format!(
                "loss={:.4} first={:.4} second={:.4} div={:.4} sim={:.3}",
                m.loss, m.first_order, m.second_order, m.diversity, m.mean_similarity
            ),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> StepMetrics {
        StepMetrics {
            loss: -1.2,
            first_order: -0.5,
            second_order: -0.1,
            diversity: -0.6,
            mean_similarity: 0.8,
        }
    }

    #[test]
    fn test_health_check_clean() {
        assert!(healthy().health_check().is_empty());
    }

    #[test]
    fn test_health_check_flags_collapse() {
        let m = StepMetrics {
            loss: f64::NAN,
            diversity: -0.01,
            mean_similarity: 1.0,
            ..healthy()
        };
        assert_eq!(m.health_check().len(), 3);
    }

    #[test]
    fn test_running_average() {
        let mut avg = RunningAverage::new();
        assert!(avg.average().is_none());
        assert_eq!(avg.display(), "no data");
        avg.update(&healthy());
        avg.update(&StepMetrics {
            loss: -0.8,
            ..healthy()
        });
        let m = avg.average().unwrap();
        assert_eq!(avg.count(), 2);
        assert!((m.loss + 1.0).abs() < 1e-12);
        assert!((m.mean_similarity - 0.8).abs() < 1e-12);
        avg.reset();
        assert_eq!(avg.count(), 0);
    }
}

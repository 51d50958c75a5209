//! Neighborhood-consistency training: loss terms, per-step metrics with
//! health checks, and the one-step trainer over the neighbor banks.

pub mod loss;
pub mod metrics;
pub mod trainer;

pub use metrics::{RunningAverage, StepMetrics};
pub use trainer::{NeighborConfig, NeighborTrainer};

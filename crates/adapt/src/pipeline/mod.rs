//! Round orchestration: the in-memory pool, the prediction buffer that
//! batches pseudo-labeled samples for training, and the labeling round.

pub mod buffer;
pub mod dataset;
pub mod round;

pub use buffer::{collect_data, Collected, PredictionBuffer};
pub use dataset::{PoolBatch, PoolDataset};
pub use round::{RoundMetrics, RoundOrchestrator, RoundOutcome, RoundSettings};

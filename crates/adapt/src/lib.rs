//! Energy-guided active domain adaptation.
//!
//! Scores an unlabeled target pool by free energy (and optionally expected
//! predictive information gain), sends a small budget of high-energy,
//! low-redundancy samples to an oracle, refines pseudo-labels by
//! nearest-centroid clustering, and adapts the classifier with a
//! k/m-nearest-neighbor consistency loss over running feature, score and
//! energy banks.

pub mod bank;
pub mod cluster;
pub mod config;
pub mod error;
pub mod information;
pub mod model;
pub mod pipeline;
pub mod selection;
pub mod training;

pub use bank::NeighborBanks;
pub use cluster::ClusteringRefiner;
pub use config::AdaptConfig;
pub use error::{AdaptError, Result};
pub use information::EpigEstimator;
pub use selection::{SelectionLedger, SelectionMode, SelectionPolicy};

//! Sample selection: the run-wide ledger and the ranking policies.

pub mod ledger;
pub mod policy;

pub use ledger::SelectionLedger;
pub use policy::{
    energy_thresholds, rank_by_energy_diversity, rank_by_information_gain, EnergyThresholds,
    Selection, SelectionMode, SelectionPolicy,
};

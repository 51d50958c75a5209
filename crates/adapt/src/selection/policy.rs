//! Budgeted sample selection: energy + diversity ranking, information-gain
//! ranking, or a uniform random baseline, all deduplicated against the
//! run-wide [`SelectionLedger`].

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_len, AdaptError, Result};
use crate::selection::ledger::SelectionLedger;

/// How candidates are ranked before the budgeted scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Highest-energy fraction, then least similar to its neighbors first.
    #[default]
    EnergyDiversity,
    /// Descending expected predictive information gain.
    InformationGain,
    /// Uniform random draw without replacement.
    Random,
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionMode::EnergyDiversity => write!(f, "energy_diversity"),
            SelectionMode::InformationGain => write!(f, "information_gain"),
            SelectionMode::Random => write!(f, "random"),
        }
    }
}

impl FromStr for SelectionMode {
    type Err = AdaptError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "energy_diversity" => Ok(SelectionMode::EnergyDiversity),
            "information_gain" => Ok(SelectionMode::InformationGain),
            "random" => Ok(SelectionMode::Random),
            other => Err(AdaptError::InvalidConfig(format!(
                "unknown selection mode '{other}' (expected energy_diversity, information_gain or random)"
            ))),
        }
    }
}

/// Energy cut-offs recomputed from the full distribution every round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyThresholds {
    /// Samples with energy below this are treated as confidently labeled (`thre_a`).
    pub confident: f32,
    /// Samples with energy above this are treated as likely unknown (`thre_w`).
    pub unknown: f32,
}

/// Descending energy sort; equal energies keep their original order.
fn sort_descending(values: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    order
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(AdaptError::InvalidConfig(format!(
            "{name} must lie in [0, 1], got {value}"
        )))
    }
}

/// Compute `thre_a` and `thre_w` from the energy distribution.
///
/// With energies sorted descending and `l` samples:
/// - `confident = sorted[l - floor(l * percen)]`, wrapping to `sorted[0]`
///   when `floor(l * percen)` is zero;
/// - `unknown = sorted[floor(l * unknown_fraction)]`.
pub fn energy_thresholds(
    energies: &[f32],
    percen: f64,
    unknown_fraction: f64,
) -> Result<EnergyThresholds> {
    if energies.is_empty() {
        return Err(AdaptError::EmptySelectionPool);
    }
    check_fraction("percen", percen)?;
    check_fraction("unknown_fraction", unknown_fraction)?;

    let l = energies.len();
    let order = sort_descending(energies);
    let n_confident = (l as f64 * percen) as usize;
    let confident_pos = (l - n_confident) % l;
    let unknown_pos = ((l as f64 * unknown_fraction) as usize).min(l - 1);

    Ok(EnergyThresholds {
        confident: energies[order[confident_pos]],
        unknown: energies[order[unknown_pos]],
    })
}

/// Rank by energy + diversity.
///
/// Keeps the `floor(fraction * N)` highest-energy samples, then orders them
/// by ascending neighbor similarity (least redundant first).
pub fn rank_by_energy_diversity(
    energies: &[f32],
    similarities: &[f32],
    fraction: f64,
) -> Result<Vec<usize>> {
    ensure_len("rank_by_energy_diversity: similarities", energies.len(), similarities.len())?;
    check_fraction("candidate_fraction", fraction)?;

    let keep = (fraction * energies.len() as f64) as usize;
    let mut candidates = sort_descending(energies);
    candidates.truncate(keep);
    candidates.sort_by(|&a, &b| similarities[a].total_cmp(&similarities[b]));
    Ok(candidates)
}

/// Rank by descending information gain.
pub fn rank_by_information_gain(scores: &[f32]) -> Vec<usize> {
    sort_descending(scores)
}

/// Indices chosen in one selection call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    /// Newly selected indices in priority order.
    pub indices: Vec<usize>,
    /// Ranked candidates skipped because an earlier round already took them.
    pub previously_labeled: usize,
}

/// Walk `ranked`, collecting up to `budget` indices not yet in the ledger.
fn scan_unlabeled(ranked: &[usize], budget: usize, ledger: &mut SelectionLedger) -> Selection {
    let mut selection = Selection::default();
    for &index in ranked {
        if selection.indices.len() >= budget {
            break;
        }
        if ledger.insert(index) {
            selection.indices.push(index);
        } else {
            selection.previously_labeled += 1;
        }
    }
    selection
}

/// Selection strategy with its own RNG for the random baseline.
#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    mode: SelectionMode,
    candidate_fraction: f64,
    rng: StdRng,
}

impl SelectionPolicy {
    /// Create a policy. `seed = None` seeds the random baseline from entropy.
    pub fn new(mode: SelectionMode, candidate_fraction: f64, seed: Option<u64>) -> Result<Self> {
        check_fraction("candidate_fraction", candidate_fraction)?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            mode,
            candidate_fraction,
            rng,
        })
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Whether [`select`](Self::select) needs information-gain scores.
    pub fn requires_information_gain(&self) -> bool {
        self.mode == SelectionMode::InformationGain
    }

    /// Select up to `budget` indices that are not in `ledger`, append them to
    /// the ledger, and return them in priority order.
    pub fn select(
        &mut self,
        energies: &[f32],
        similarities: &[f32],
        information_gain: Option<&[f32]>,
        budget: usize,
        ledger: &mut SelectionLedger,
    ) -> Result<Selection> {
        let selection = match self.mode {
            SelectionMode::EnergyDiversity => {
                let ranked = rank_by_energy_diversity(energies, similarities, self.candidate_fraction)?;
                scan_unlabeled(&ranked, budget, ledger)
            }
            SelectionMode::InformationGain => {
                let scores = information_gain.ok_or_else(|| {
                    AdaptError::InvalidConfig(
                        "information_gain selection requires information-gain scores".to_string(),
                    )
                })?;
                ensure_len("select: information gain scores", energies.len(), scores.len())?;
                scan_unlabeled(&rank_by_information_gain(scores), budget, ledger)
            }
            SelectionMode::Random => self.draw_random(energies.len(), budget, ledger),
        };

        tracing::info!(
            mode = %self.mode,
            budget,
            selected = selection.indices.len(),
            previously_labeled = selection.previously_labeled,
            ledger_size = ledger.len(),
            "Selected samples for labeling"
        );
        Ok(selection)
    }

    fn draw_random(&mut self, n: usize, budget: usize, ledger: &mut SelectionLedger) -> Selection {
        let available: Vec<usize> = (0..n).filter(|&i| !ledger.contains(i)).collect();
        let indices: Vec<usize> = available
            .choose_multiple(&mut self.rng, budget.min(available.len()))
            .copied()
            .collect();
        ledger.extend(indices.iter().copied());
        Selection {
            indices,
            previously_labeled: 0,
        }
    }
}

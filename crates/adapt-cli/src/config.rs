//! TOML config loading for the adaptation CLI.
//!
//! Reads `configs/adapt.toml` into [`AdaptConfig`], then merges CLI overrides.

use std::path::Path;

use adapt::{AdaptConfig, SelectionMode};
use anyhow::Context;

/// Command-line values that take precedence over the TOML file.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub rounds: Option<usize>,
    pub seed: Option<u64>,
    pub budget: Option<usize>,
    pub batch_size: Option<usize>,
    pub mode: Option<SelectionMode>,
}

/// Load and deserialize an [`AdaptConfig`] from a TOML file.
pub fn load_config(path: &Path) -> anyhow::Result<AdaptConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: AdaptConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded adaptation config");
    Ok(config)
}

/// Build the effective run configuration.
///
/// Priority chain: built-in defaults < TOML values < CLI flags. A missing
/// `path` means defaults only. The result is validated.
pub fn build_config(path: Option<&Path>, overrides: &CliOverrides) -> anyhow::Result<AdaptConfig> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => AdaptConfig::default(),
    };

    if let Some(rounds) = overrides.rounds {
        config.run.rounds = rounds;
    }
    if let Some(seed) = overrides.seed {
        config.run.seed = Some(seed);
    }
    if let Some(budget) = overrides.budget {
        config.run.budget = budget;
    }
    if let Some(batch_size) = overrides.batch_size {
        config.run.batch_size = batch_size;
    }
    if let Some(mode) = overrides.mode {
        config.selection.mode = mode;
    }

    config.validate().context("invalid adaptation config")?;
    Ok(config)
}

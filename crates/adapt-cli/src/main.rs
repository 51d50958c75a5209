mod config;
mod pipeline;
pub mod results;
mod synthetic;

use std::path::PathBuf;

use adapt::SelectionMode;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::CliOverrides;
use pipeline::{RunArgs, ShowConfigArgs};

/// active-adapt: energy-guided active domain adaptation on a shifted pool.
#[derive(Parser)]
#[command(name = "active-adapt", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for adaptation runs and config inspection.
#[derive(Subcommand)]
enum Command {
    /// Pre-train on the source domain, then run labeling rounds with
    /// neighborhood self-training on the target pool.
    Run {
        /// Path to the adaptation config TOML file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the number of labeling rounds.
        #[arg(long)]
        rounds: Option<usize>,
        /// Override the seed for data generation, shuffling and random selection.
        #[arg(long)]
        seed: Option<u64>,
        /// Override the oracle labels requested per round.
        #[arg(long)]
        budget: Option<usize>,
        /// Override the training batch size.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Override the selection mode: energy_diversity, information_gain or random.
        #[arg(long)]
        mode: Option<SelectionMode>,
        /// File receiving the per-round accuracy lines (stderr when omitted).
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Print the run report as JSON instead of a text summary.
        #[arg(long)]
        json: bool,
        /// Also write the JSON run report to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration after defaults, TOML and overrides.
    ShowConfig {
        /// Path to the adaptation config TOML file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the number of labeling rounds.
        #[arg(long)]
        rounds: Option<usize>,
        /// Override the selection mode.
        #[arg(long)]
        mode: Option<SelectionMode>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            rounds,
            seed,
            budget,
            batch_size,
            mode,
            log_file,
            json,
            output,
        } => pipeline::run_adapt(RunArgs {
            config,
            overrides: CliOverrides {
                rounds,
                seed,
                budget,
                batch_size,
                mode,
            },
            log_file,
            json,
            output,
        })
        .map(|_| ()),
        Command::ShowConfig {
            config,
            rounds,
            mode,
        } => pipeline::run_show_config(ShowConfigArgs {
            config,
            overrides: CliOverrides {
                rounds,
                mode,
                ..CliOverrides::default()
            },
        }),
    }
}

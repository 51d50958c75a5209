//! Adaptation pipeline: source pre-training, labeling rounds and
//! neighborhood self-training on the shifted target pool.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use adapt::config::{AdaptConfig, RunConfig};
use adapt::model::bridge::{indices_to_tensor, int_tensor_to_indices, tensor_to_f64};
use adapt::model::{AdaptNet, Backbone, Classifier};
use adapt::pipeline::{PoolBatch, PoolDataset, PredictionBuffer};
use adapt::training::{NeighborTrainer, RunningAverage, StepMetrics};
use adapt::NeighborBanks;

use crate::config::{build_config, CliOverrides};
use crate::results::{RoundReport, RunReport};
use crate::synthetic;

type InferenceBackend = NdArray<f32>;
type TrainBackend = Autodiff<NdArray<f32>>;

/// Arguments for the `run` subcommand.
#[derive(Debug)]
pub struct RunArgs {
    /// Path to the TOML config; `None` uses built-in defaults.
    pub config: Option<PathBuf>,
    /// CLI overrides applied on top of the TOML values.
    pub overrides: CliOverrides,
    /// File receiving the per-round accuracy lines; stderr when absent.
    pub log_file: Option<PathBuf>,
    /// Print the run report as JSON on stdout.
    pub json: bool,
    /// Also write the run report to this path.
    pub output: Option<PathBuf>,
}

/// Arguments for the `show-config` subcommand.
#[derive(Debug)]
pub struct ShowConfigArgs {
    pub config: Option<PathBuf>,
    pub overrides: CliOverrides,
}

fn progress_bar(len: usize) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("=> "),
    );
    Ok(pb)
}

/// Fraction (percent) of `dataset` the model classifies correctly.
fn pool_accuracy(
    model: &AdaptNet<InferenceBackend>,
    dataset: &PoolDataset,
    batch_size: usize,
    device: &NdArrayDevice,
) -> anyhow::Result<f64> {
    let mut hits = 0usize;
    for batch in dataset.batches::<InferenceBackend>(batch_size, device)? {
        let logits = model.logits(model.embed(batch.inputs), false);
        let predicted = int_tensor_to_indices(logits.argmax(1));
        hits += predicted
            .iter()
            .zip(&batch.labels)
            .filter(|(p, t)| p == t)
            .count();
    }
    Ok(100.0 * hits as f64 / dataset.len().max(1) as f64)
}

/// Supervised cross-entropy on the labeled source domain for a fixed number
/// of steps at a constant learning rate.
fn train_source(
    mut model: AdaptNet<TrainBackend>,
    source: &PoolDataset,
    run: &RunConfig,
    rng: &mut StdRng,
    device: &NdArrayDevice,
) -> anyhow::Result<AdaptNet<TrainBackend>> {
    anyhow::ensure!(!source.is_empty(), "source domain is empty");
    let mut optimizer = AdamWConfig::new().init::<TrainBackend, AdaptNet<TrainBackend>>();
    let loss_fn = CrossEntropyLossConfig::new().init(device);

    let pb = progress_bar(run.source_steps)?;
    pb.set_message("source");
    let mut step = 0usize;
    let mut last_loss = f64::NAN;
    while step < run.source_steps {
        for batch in source.shuffled_batches::<TrainBackend>(run.batch_size, rng, device)? {
            if step >= run.source_steps {
                break;
            }
            let targets = indices_to_tensor::<TrainBackend>(&batch.labels, device);
            let logits = model.logits(model.embed(batch.inputs), false);
            let loss = loss_fn.forward(logits, targets);
            last_loss = tensor_to_f64(loss.clone());

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(run.source_lr, model, grads);
            step += 1;
            pb.inc(1);
            if step % 50 == 0 {
                pb.set_message(format!("source loss={last_loss:.4}"));
            }
        }
    }
    pb.finish_and_clear();
    tracing::info!(steps = step, loss = last_loss, "Source training complete");
    Ok(model)
}

/// One neighborhood step on a flushed batch; degenerate states are logged.
fn step_on<O>(
    trainer: &mut NeighborTrainer<TrainBackend, AdaptNet<TrainBackend>, O>,
    model: AdaptNet<TrainBackend>,
    batch: PoolBatch<TrainBackend>,
    banks: &mut NeighborBanks,
    average: &mut RunningAverage,
) -> anyhow::Result<(AdaptNet<TrainBackend>, StepMetrics)>
where
    O: Optimizer<AdaptNet<TrainBackend>, TrainBackend>,
{
    let (model, metrics) = trainer.train_step(model, batch.inputs, &batch.indices, banks)?;
    for warning in metrics.health_check() {
        tracing::warn!(step = trainer.steps(), "{warning}");
    }
    average.update(&metrics);
    Ok((model, metrics))
}

/// Run labeling rounds and self-training; returns the run report.
pub fn run_adapt(args: RunArgs) -> anyhow::Result<RunReport> {
    let start = Instant::now();

    // 1. Load config
    let config = build_config(args.config.as_deref(), &args.overrides)?;
    let run = &config.run;
    let device = NdArrayDevice::default();
    let mut rng = match run.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    tracing::info!(
        mode = %config.selection.mode,
        rounds = run.rounds,
        budget = run.budget,
        batch_size = run.batch_size,
        seed = ?run.seed,
        "Starting adaptation run"
    );

    // 2. Synthetic domains
    let domains = synthetic::generate(&config.pool, &mut rng)?;
    let target = &domains.target;

    // 3. Source model
    let model = config.network_config().init::<TrainBackend>(&device);
    let mut model = train_source(model, &domains.source, run, &mut rng, &device)?;
    let source_accuracy = pool_accuracy(&model.valid(), target, run.batch_size, &device)?;
    tracing::info!(source_accuracy, "Source model on target pool");

    // 4. Banks, orchestrator, trainer
    let mut banks = NeighborBanks::warm_up(
        &model.valid(),
        target.batches::<InferenceBackend>(run.batch_size, &device)?,
        target.len(),
        config.neighbors.norm_eps,
    )?;
    let mut orchestrator = config.orchestrator()?;
    let optimizer = config
        .neighbors
        .adamw::<TrainBackend, AdaptNet<TrainBackend>>();
    let mut trainer = NeighborTrainer::new(config.neighbors.clone(), optimizer)?;
    let mut buffer = PredictionBuffer::<TrainBackend>::new(run.batch_size)?;

    let mut log: Box<dyn Write> = match &args.log_file {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("failed to create log file {}", path.display()))?,
        ),
        None => Box::new(std::io::stderr()),
    };

    // 5. Rounds
    let mut reports = Vec::with_capacity(run.rounds);
    for round in 1..=run.rounds {
        let last = round == run.rounds;
        let outcome = orchestrator.obtain_labels(
            &model.valid(),
            target.batches::<InferenceBackend>(run.batch_size, &device)?,
            banks.similarities(),
            run.budget,
            last,
            log.as_mut(),
        )?;

        // Confident samples are gathered from shuffled pool batches, so
        // training batches fill up unevenly and go through the buffer.
        let confident: HashSet<usize> = outcome.confident.iter().copied().collect();
        let mut order: Vec<usize> = (0..target.len()).collect();
        order.shuffle(&mut rng);

        let pb = progress_bar(order.len().div_ceil(run.batch_size))?;
        pb.set_message(format!("round {round}"));
        let mut average = RunningAverage::new();
        let steps_before = trainer.steps();
        for chunk in order.chunks(run.batch_size) {
            pb.inc(1);
            let keep: Vec<usize> = chunk.iter().copied().filter(|i| confident.contains(i)).collect();
            if keep.is_empty() {
                continue;
            }
            let mut batch = target.batch_of::<TrainBackend>(&keep, &device)?;
            batch.labels = keep.iter().map(|&i| outcome.pseudo_labels[i]).collect();
            if let Some(ready) = buffer.push(batch)? {
                let (next, metrics) = step_on(&mut trainer, model, ready, &mut banks, &mut average)?;
                model = next;
                pb.set_message(format!("round {round} loss={:.4}", metrics.loss));
            }
        }
        if last {
            if let Some(rest) = buffer.drain() {
                let (next, _) = step_on(&mut trainer, model, rest, &mut banks, &mut average)?;
                model = next;
            }
        }
        pb.finish_and_clear();

        let train_steps = trainer.steps() - steps_before;
        tracing::info!(round, train_steps, "Round training: {}", average.display());
        reports.push(RoundReport::from_outcome(
            round,
            last,
            &outcome,
            train_steps,
            average.average(),
        ));
    }

    // 6. Summary
    let adapted_accuracy = pool_accuracy(&model.valid(), target, run.batch_size, &device)?;
    let report = RunReport {
        mode: config.selection.mode.to_string(),
        seed: run.seed,
        pool_size: target.len(),
        budget: run.budget,
        source_accuracy,
        adapted_accuracy,
        labeled: orchestrator.ledger().len(),
        rounds: reports,
        elapsed_secs: start.elapsed().as_secs_f64(),
    };

    if let Some(path) = &args.output {
        report.save(path)?;
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\n--- Adaptation Summary ---");
        println!("Mode:             {}", report.mode);
        println!("Rounds:           {}", report.rounds.len());
        println!("Oracle labels:    {}", report.labeled);
        println!("Source accuracy:  {:.2}%", report.source_accuracy);
        println!("Adapted accuracy: {:.2}%", report.adapted_accuracy);
        println!("Elapsed:          {:.1}s", report.elapsed_secs);
    }

    Ok(report)
}

/// Print the effective configuration (defaults < TOML < CLI) as TOML.
pub fn run_show_config(args: ShowConfigArgs) -> anyhow::Result<()> {
    let config: AdaptConfig = build_config(args.config.as_deref(), &args.overrides)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

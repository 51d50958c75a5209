//! Synthetic source/target domains: Gaussian blobs around axis-aligned class
//! means, with the target pool offset by a constant shift.

use adapt::config::PoolConfig;
use adapt::pipeline::PoolDataset;
use rand::rngs::StdRng;
use rand::Rng;

/// Labeled source domain and the shifted target pool drawn from the same
/// class means.
#[derive(Debug, Clone)]
pub struct Domains {
    pub source: PoolDataset,
    pub target: PoolDataset,
}

/// Standard normal sample via Box-Muller.
fn standard_normal(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

/// Class `c` sits on axis `c mod dim`, negated on every other wrap, at
/// distance `separation / √2` from the origin. Means on distinct axes are
/// exactly `separation` apart.
pub fn class_means(config: &PoolConfig) -> Vec<Vec<f32>> {
    let radius = config.separation / std::f32::consts::SQRT_2;
    (0..config.num_classes)
        .map(|c| {
            let mut mean = vec![0.0; config.input_dim];
            let sign = if (c / config.input_dim) % 2 == 0 { 1.0 } else { -1.0 };
            mean[c % config.input_dim] = sign * radius;
            mean
        })
        .collect()
}

fn sample_domain(
    means: &[Vec<f32>],
    config: &PoolConfig,
    shift: f32,
    rng: &mut StdRng,
) -> anyhow::Result<PoolDataset> {
    let mut inputs = Vec::with_capacity(config.size * config.input_dim);
    let mut labels = Vec::with_capacity(config.size);
    for _ in 0..config.size {
        let label = rng.gen_range(0..config.num_classes);
        for &mu in &means[label] {
            inputs.push(mu + shift + config.noise * standard_normal(rng));
        }
        labels.push(label);
    }
    Ok(PoolDataset::new(inputs, labels, config.input_dim)?)
}

/// Draw `config.size` source samples and `config.size` target samples.
pub fn generate(config: &PoolConfig, rng: &mut StdRng) -> anyhow::Result<Domains> {
    anyhow::ensure!(config.num_classes > 0, "pool.num_classes must be positive");
    anyhow::ensure!(config.input_dim > 0, "pool.input_dim must be positive");
    let means = class_means(config);
    let source = sample_domain(&means, config, 0.0, rng)?;
    let target = sample_domain(&means, config, config.shift, rng)?;
    tracing::info!(
        size = config.size,
        classes = config.num_classes,
        dim = config.input_dim,
        shift = config.shift,
        "Generated synthetic domains"
    );
    Ok(Domains { source, target })
}

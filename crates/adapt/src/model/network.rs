use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;
use burn::tensor::Distribution;

/// Feature extractor: raw inputs to bottleneck features.
pub trait Backbone<B: Backend> {
    /// Input shape: `(batch, d_input)`; output shape: `(batch, d_feature)`.
    fn embed(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2>;
}

/// Classifier head over backbone features.
///
/// With `stochastic = true` repeated calls on the same features must yield
/// different logits (fresh dropout mask per call). This is what the
/// information-gain estimator samples from.
pub trait Classifier<B: Backend> {
    /// Input shape: `(batch, d_feature)`; output shape: `(batch, classes)`.
    fn logits(&self, features: Tensor<B, 2>, stochastic: bool) -> Tensor<B, 2>;

    /// Number of output classes.
    fn num_classes(&self) -> usize;
}

/// Configuration for [`AdaptNet`].
///
/// ```text
/// (batch, d_input)
///   → Linear(d_input→d_hidden) → ReLU              (backbone)
///   → Linear(d_hidden→d_bottleneck)                (bottleneck)
///   → [MC dropout when stochastic]
///   → Linear(d_bottleneck→num_classes)             (classifier)
///   → logits: (batch, num_classes)
/// ```
#[derive(Config, Debug)]
pub struct AdaptNetConfig {
    /// Raw input dimension.
    pub d_input: usize,
    /// Number of classes.
    pub num_classes: usize,
    /// Backbone hidden dimension.
    #[config(default = 256)]
    pub d_hidden: usize,
    /// Bottleneck (feature bank) dimension.
    #[config(default = 256)]
    pub d_bottleneck: usize,
    /// Drop probability of the Monte-Carlo dropout used in stochastic passes.
    #[config(default = 0.5)]
    pub mc_dropout: f64,
}

/// Reference source model: backbone, bottleneck and a linear classifier with
/// Monte-Carlo dropout.
///
/// burn's `Dropout` module is inert outside autodiff training, so the
/// stochastic mask is drawn explicitly; it stays active in inference mode,
/// which is exactly what repeated-sample information gain needs.
#[derive(Module, Debug)]
pub struct AdaptNet<B: Backend> {
    /// Backbone projection.
    backbone: Linear<B>,
    /// Bottleneck projection producing bank features.
    bottleneck: Linear<B>,
    /// Linear classifier over bottleneck features.
    classifier: Linear<B>,
    activation: Relu,
    mc_dropout: f64,
    num_classes: usize,
}

impl AdaptNetConfig {
    /// Initialize an [`AdaptNet`] with the given configuration.
    pub fn init<B: Backend>(&self, device: &B::Device) -> AdaptNet<B> {
        AdaptNet {
            backbone: LinearConfig::new(self.d_input, self.d_hidden).init(device),
            bottleneck: LinearConfig::new(self.d_hidden, self.d_bottleneck).init(device),
            classifier: LinearConfig::new(self.d_bottleneck, self.num_classes).init(device),
            activation: Relu::new(),
            mc_dropout: self.mc_dropout,
            num_classes: self.num_classes,
        }
    }
}

impl<B: Backend> Backbone<B> for AdaptNet<B> {
    fn embed(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.backbone.forward(inputs);
        let x = self.activation.forward(x);
        self.bottleneck.forward(x)
    }
}

impl<B: Backend> Classifier<B> for AdaptNet<B> {
    fn logits(&self, features: Tensor<B, 2>, stochastic: bool) -> Tensor<B, 2> {
        let features = if stochastic && self.mc_dropout > 0.0 {
            let keep = 1.0 - self.mc_dropout;
            let mask = Tensor::<B, 2>::random(
                features.dims(),
                Distribution::Bernoulli(keep),
                &features.device(),
            );
            features * mask / keep
        } else {
            features
        };
        self.classifier.forward(features)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn small_config() -> AdaptNetConfig {
        AdaptNetConfig::new(8, 3).with_d_hidden(16).with_d_bottleneck(6)
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let net = small_config().init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 2>::random([5, 8], Distribution::Normal(0.0, 1.0), &device);
        let feats = net.embed(x);
        assert_eq!(feats.dims(), [5, 6]);
        let logits = net.logits(feats, false);
        assert_eq!(logits.dims(), [5, 3]);
        assert_eq!(net.num_classes(), 3);
    }

    #[test]
    fn test_deterministic_without_stochastic_flag() {
        let device = Default::default();
        let net = small_config().init::<TestBackend>(&device);
        let feats = Tensor::<TestBackend, 2>::random([4, 6], Distribution::Normal(0.0, 1.0), &device);
        let a = net.logits(feats.clone(), false);
        let b = net.logits(feats, false);
        let diff: f32 = (a - b).abs().sum().into_scalar().elem();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_stochastic_passes_differ() {
        let device = Default::default();
        let net = small_config().init::<TestBackend>(&device);
        let feats = Tensor::<TestBackend, 2>::random([16, 6], Distribution::Normal(0.0, 1.0), &device);
        let a = net.logits(feats.clone(), true);
        let b = net.logits(feats, true);
        let diff: f32 = (a - b).abs().sum().into_scalar().elem();
        assert!(diff > 1e-6, "stochastic passes should differ, diff={diff}");
    }

    #[test]
    fn test_gradient_reaches_classifier() {
        use burn::optim::GradientsParams;

        let device = Default::default();
        let net = small_config().init::<TestAutodiffBackend>(&device);
        let x = Tensor::<TestAutodiffBackend, 2>::random(
            [4, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let loss = net.logits(net.embed(x), false).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &net);
        let g = grads
            .get::<NdArray<f32>, 2>(net.classifier.weight.id)
            .expect("classifier weight should have gradient");
        let g_sum: f32 = g.abs().sum().into_scalar().elem();
        assert!(g_sum > 0.0);
    }
}

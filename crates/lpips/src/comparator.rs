use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Dropout, DropoutConfig};
use burn::{
    config::Config,
    module::Module,
    tensor::{Tensor, backend::Backend},
};

/// A single linear layer which does a 1x1 conv, collapsing one pyramid level to one channel.
#[derive(Config, Debug)]
pub struct ScaleComparatorConfig {
    pub channels: usize,
    /// Regularize with dropout. Only has an effect on autodiff backends.
    #[config(default = true)]
    pub dropout: bool,
    #[config(default = 0.5)]
    pub dropout_prob: f64,
}

impl ScaleComparatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ScaleComparator<B> {
        // Dropout with p = 0 is a no-op.
        let dropout_prob = if self.dropout { self.dropout_prob } else { 0.0 };
        ScaleComparator {
            dropout: DropoutConfig::new(dropout_prob).init(),
            conv: Conv2dConfig::new([self.channels, 1], [1, 1])
                .with_bias(false)
                .init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct ScaleComparator<B: Backend> {
    dropout: Dropout,
    pub(crate) conv: Conv2d<B>,
}

impl<B: Backend> ScaleComparator<B> {
    /// `[batch, channels, h, w] -> [batch, 1, h, w]`
    pub fn forward(&self, diff: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(self.dropout.forward(diff))
    }

    pub fn channels(&self) -> usize {
        self.conv.weight.val().dims()[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::Param;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn uniform_weights<B: Backend>(
        mut comparator: ScaleComparator<B>,
        device: &B::Device,
    ) -> ScaleComparator<B> {
        let channels = comparator.channels();
        let weight = Tensor::ones([1, channels, 1, 1], device) / channels as f64;
        comparator.conv.weight = Param::from_tensor(weight);
        comparator
    }

    #[test]
    fn collapses_channels() {
        let device = Default::default();
        let comparator = ScaleComparatorConfig::new(32).init::<TestBackend>(&device);
        let diff = Tensor::<TestBackend, 4>::random([3, 32, 6, 5], Distribution::Default, &device);

        assert_eq!(comparator.forward(diff).dims(), [3, 1, 6, 5]);
    }

    #[test]
    fn dropout_is_identity_at_inference() {
        let device = Default::default();
        let comparator = ScaleComparatorConfig::new(8).init::<TestBackend>(&device);
        let comparator = uniform_weights(comparator, &device);
        let diff = Tensor::<TestBackend, 4>::ones([1, 8, 4, 4], &device);

        let out = comparator
            .forward(diff)
            .into_data()
            .to_vec::<f32>()
            .expect("Wrong type");
        for v in out {
            assert_approx_eq!(v, 1.0, 1e-6);
        }
    }

    #[test]
    fn dropout_active_when_training() {
        type TrainBackend = Autodiff<NdArray>;
        let device = Default::default();
        let comparator = ScaleComparatorConfig::new(512).init::<TrainBackend>(&device);
        let comparator = uniform_weights(comparator, &device);
        let diff = Tensor::<TrainBackend, 4>::ones([1, 512, 4, 4], &device);

        let out = comparator
            .forward(diff)
            .into_data()
            .to_vec::<f32>()
            .expect("Wrong type");
        // With half the inputs dropped (and the rest scaled by 2) at least one
        // location is practically guaranteed to deviate from 1.
        assert!(out.iter().any(|v| (v - 1.0).abs() > 1e-4), "Dropout did not run");
    }
}

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, PaddingConfig2d, Relu};
use burn::{
    config::Config,
    module::Module,
    tensor::{Tensor, backend::Backend},
};

use crate::base_channels;
use crate::residual::{ResidualBlock, ResidualBlockConfig};

#[derive(Config, Debug)]
pub struct ImageEncoderConfig {
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 256)]
    pub latent_dim: usize,
    #[config(default = 1.0)]
    pub width_mult: f64,
    #[config(default = 8)]
    pub groups: usize,
}

impl ImageEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ImageEncoder<B> {
        let base = base_channels(self.width_mult);

        ImageEncoder {
            stem: Conv2dConfig::new([self.in_channels, base], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            stem_norm: GroupNormConfig::new(self.groups, base).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            block: ResidualBlockConfig::new(base, 2 * base)
                .with_stride(2)
                .with_groups(self.groups)
                .init(device),
            to_latent: Conv2dConfig::new([2 * base, self.latent_dim], [1, 1])
                .with_bias(false)
                .init(device),
        }
    }
}

/// Downsamples images by 8 into a `latent_dim` channel map.
#[derive(Module, Debug)]
pub struct ImageEncoder<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: GroupNorm<B>,
    relu: Relu,
    pool: MaxPool2d,
    block: ResidualBlock<B>,
    to_latent: Conv2d<B>,
}

impl<B: Backend> ImageEncoder<B> {
    /// `[batch, in_channels, h, w] -> [batch, latent_dim, h / 8, w / 8]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let _span = tracing::trace_span!("Encode").entered();

        let x = self.stem.forward(images);
        let x = self.relu.forward(self.stem_norm.forward(x));
        let x = self.pool.forward(x);
        let x = self.block.forward(x);
        self.to_latent.forward(x)
    }
}

use burn::nn::conv::{ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, Relu};
use burn::tensor::activation::tanh;
use burn::{
    config::Config,
    module::Module,
    tensor::{Tensor, backend::Backend},
};

use crate::base_channels;
use crate::residual::{ResidualBlock, ResidualBlockConfig};

#[derive(Config, Debug)]
pub struct ImageDecoderConfig {
    #[config(default = 3)]
    pub out_channels: usize,
    #[config(default = 256)]
    pub latent_dim: usize,
    #[config(default = 1.0)]
    pub width_mult: f64,
    #[config(default = 8)]
    pub groups: usize,
}

impl ImageDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ImageDecoder<B> {
        let base = base_channels(self.width_mult);

        ImageDecoder {
            from_latent: ConvTranspose2dConfig::new([self.latent_dim, 2 * base], [1, 1])
                .with_bias(false)
                .init(device),
            block1: ResidualBlockConfig::new(2 * base, 2 * base)
                .with_groups(self.groups)
                .init(device),
            up1: ConvTranspose2dConfig::new([2 * base, base], [4, 4])
                .with_stride([2, 2])
                .with_padding([1, 1])
                .init(device),
            up1_norm: GroupNormConfig::new(self.groups, base).init(device),
            relu: Relu::new(),
            block2: ResidualBlockConfig::new(base, base)
                .with_groups(self.groups)
                .init(device),
            // Non-overlapping 4x4 patches, so the last step upsamples by 4 at once.
            up2: ConvTranspose2dConfig::new([base, self.out_channels], [4, 4])
                .with_stride([4, 4])
                .init(device),
        }
    }
}

/// Mirrors [`crate::encoder::ImageEncoder`], upsampling a latent by 8 back to an image in [-1, 1].
#[derive(Module, Debug)]
pub struct ImageDecoder<B: Backend> {
    from_latent: ConvTranspose2d<B>,
    block1: ResidualBlock<B>,
    up1: ConvTranspose2d<B>,
    up1_norm: GroupNorm<B>,
    relu: Relu,
    block2: ResidualBlock<B>,
    up2: ConvTranspose2d<B>,
}

impl<B: Backend> ImageDecoder<B> {
    /// `[batch, latent_dim, h, w] -> [batch, out_channels, 8h, 8w]`
    pub fn forward(&self, latent: Tensor<B, 4>) -> Tensor<B, 4> {
        let _span = tracing::trace_span!("Decode").entered();

        let x = self.from_latent.forward(latent);
        let x = self.block1.forward(x);
        let x = self.up1.forward(x);
        let x = self.relu.forward(self.up1_norm.forward(x));
        let x = self.block2.forward(x);
        tanh(self.up2.forward(x))
    }
}

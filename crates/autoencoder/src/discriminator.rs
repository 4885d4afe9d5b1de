use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, LeakyRelu, LeakyReluConfig, PaddingConfig2d};
use burn::{
    config::Config,
    module::Module,
    tensor::{Tensor, backend::Backend},
};

/// Groups of the two normalized discriminator layers.
const NORM_GROUPS: usize = 8;

#[derive(Config, Debug)]
pub struct PatchDiscriminatorConfig {
    #[config(default = 3)]
    pub in_channels: usize,
    /// Channels of the first layer, doubled on every following one.
    #[config(default = 64)]
    pub base_channels: usize,
    #[config(default = 0.2)]
    pub negative_slope: f64,
}

impl PatchDiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PatchDiscriminator<B> {
        let base = self.base_channels;
        let conv = |in_channels, out_channels| {
            Conv2dConfig::new([in_channels, out_channels], [4, 4])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(true)
                .init(device)
        };

        PatchDiscriminator {
            conv1: conv(self.in_channels, base),
            conv2: conv(base, 2 * base),
            norm2: GroupNormConfig::new(NORM_GROUPS, 2 * base).init(device),
            conv3: conv(2 * base, 4 * base),
            norm3: GroupNormConfig::new(NORM_GROUPS, 4 * base).init(device),
            conv4: conv(4 * base, 1),
            activation: LeakyReluConfig::new()
                .with_negative_slope(self.negative_slope)
                .init(),
        }
    }
}

/// Scores overlapping patches of an image as real or fake.
///
/// Every output location sees one receptive field of the input, a 256x256 image
/// gives a 16x16 map of logits.
#[derive(Module, Debug)]
pub struct PatchDiscriminator<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    norm2: GroupNorm<B>,
    conv3: Conv2d<B>,
    norm3: GroupNorm<B>,
    conv4: Conv2d<B>,
    activation: LeakyRelu,
}

impl<B: Backend> PatchDiscriminator<B> {
    /// `[batch, in_channels, h, w] -> [batch, 1, h / 16, w / 16]` raw logits.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let _span = tracing::trace_span!("Discriminate").entered();

        let x = self.activation.forward(self.conv1.forward(images));
        let x = self
            .activation
            .forward(self.norm2.forward(self.conv2.forward(x)));
        let x = self
            .activation
            .forward(self.norm3.forward(self.conv3.forward(x)));
        self.conv4.forward(x)
    }
}

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::{
    config::Config,
    module::Module,
    tensor::{Tensor, backend::Backend},
};

#[derive(Config, Debug)]
pub struct ResidualBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    #[config(default = 1)]
    pub stride: usize,
    /// Groups of every GroupNorm. Must divide `out_channels`.
    #[config(default = 8)]
    pub groups: usize,
}

impl ResidualBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResidualBlock<B> {
        let conv3x3 = |in_channels, stride| {
            Conv2dConfig::new([in_channels, self.out_channels], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device)
        };
        let norm = || GroupNormConfig::new(self.groups, self.out_channels).init(device);

        let shortcut = (self.stride != 1 || self.in_channels != self.out_channels).then(|| {
            let proj = Conv2dConfig::new([self.in_channels, self.out_channels], [1, 1])
                .with_stride([self.stride, self.stride])
                .with_bias(false)
                .init(device);
            Projection {
                conv: proj,
                norm: norm(),
            }
        });

        ResidualBlock {
            conv1: conv3x3(self.in_channels, self.stride),
            norm1: norm(),
            conv2: conv3x3(self.out_channels, 1),
            norm2: norm(),
            shortcut,
        }
    }
}

/// 1x1 conv matching the shortcut to the main branch.
#[derive(Module, Debug)]
pub struct Projection<B: Backend> {
    conv: Conv2d<B>,
    norm: GroupNorm<B>,
}

/// Two 3x3 convs with a skip connection around them.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: GroupNorm<B>,
    conv2: Conv2d<B>,
    norm2: GroupNorm<B>,
    /// `None` when the input can be added as is.
    shortcut: Option<Projection<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let main = relu(self.norm1.forward(self.conv1.forward(input.clone())));
        let main = self.norm2.forward(self.conv2.forward(main));

        let skip = match &self.shortcut {
            Some(proj) => proj.norm.forward(proj.conv.forward(input)),
            None => input,
        };
        relu(main + skip)
    }

    pub fn has_projection(&self) -> bool {
        self.shortcut.is_some()
    }
}

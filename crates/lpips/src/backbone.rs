use burn::nn::PaddingConfig2d;
use burn::nn::Relu;
use burn::nn::conv::Conv2d;
use burn::nn::conv::Conv2dConfig;
use burn::nn::pool::MaxPool2d;
use burn::nn::pool::MaxPool2dConfig;
use burn::tensor::Device;
use burn::{
    config::Config,
    module::Module,
    tensor::{Tensor, backend::Backend},
};

/// Number of pyramid levels the backbone produces.
pub const LEVELS: usize = 5;

/// Channel count of every pyramid level, level-ascending.
pub const LEVEL_CHANNELS: [usize; LEVELS] = [64, 128, 256, 512, 512];

/// Convolutions per stage of the VGG16 feature stack.
const STAGE_CONVS: [usize; LEVELS] = [2, 2, 3, 3, 3];

/// Spatial reduction between the input and the deepest level.
pub const TOTAL_DOWNSAMPLING: usize = 1 << (LEVELS - 1);

struct ConvReluConfig {
    conv: Conv2dConfig,
}

impl ConvReluConfig {
    fn new(in_channels: usize, out_channels: usize) -> Self {
        // conv3x3, torchvision VGG carries a bias on every conv.
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(true);
        Self { conv }
    }

    fn init<B: Backend>(&self, device: &Device<B>) -> ConvRelu<B> {
        ConvRelu {
            conv: self.conv.init(device),
            relu: Relu::new(),
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvRelu<B: Backend> {
    pub(crate) conv: Conv2d<B>,
    relu: Relu,
}

impl<B: Backend> ConvRelu<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(input);
        self.relu.forward(out)
    }
}

#[derive(Config)]
struct VggStageConfig {
    num_convs: usize,
    in_channels: usize,
    out_channels: usize,
    /// Every stage but the first starts by halving the resolution.
    pooled: bool,
}

impl VggStageConfig {
    fn init<B: Backend>(&self, device: &Device<B>) -> VggStage<B> {
        let convs = (0..self.num_convs)
            .map(|c| {
                let in_channels = if c == 0 {
                    self.in_channels
                } else {
                    self.out_channels
                };
                ConvReluConfig::new(in_channels, self.out_channels).init(device)
            })
            .collect();

        VggStage {
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            pooled: self.pooled,
            convs,
        }
    }
}

#[derive(Module, Debug)]
pub struct VggStage<B: Backend> {
    pool: MaxPool2d,
    pooled: bool,
    pub(crate) convs: Vec<ConvRelu<B>>,
}

impl<B: Backend> VggStage<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut cur = if self.pooled {
            self.pool.forward(input)
        } else {
            input
        };
        for conv in &self.convs {
            cur = conv.forward(cur);
        }
        cur
    }
}

/// Activations of the five VGG16 stages, named after the last layer of each stage.
#[derive(Debug, Clone)]
pub struct VggFeatures<B: Backend> {
    pub relu1_2: Tensor<B, 4>,
    pub relu2_2: Tensor<B, 4>,
    pub relu3_3: Tensor<B, 4>,
    pub relu4_3: Tensor<B, 4>,
    pub relu5_3: Tensor<B, 4>,
}

impl<B: Backend> VggFeatures<B> {
    /// Levels in ascending order (finest first). Downstream code indexes by position.
    pub fn into_levels(self) -> [Tensor<B, 4>; LEVELS] {
        [
            self.relu1_2,
            self.relu2_2,
            self.relu3_3,
            self.relu4_3,
            self.relu5_3,
        ]
    }
}

/// Frozen VGG16 feature stack, cut into the five stages LPIPS compares.
#[derive(Module, Debug)]
pub struct VggBackbone<B: Backend> {
    pub(crate) stages: Vec<VggStage<B>>,
}

impl<B: Backend> VggBackbone<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> VggFeatures<B> {
        let _span = tracing::trace_span!("VGG features").entered();

        let mut fold = images;
        let mut levels = Vec::with_capacity(LEVELS);
        for stage in &self.stages {
            fold = stage.forward(fold);
            levels.push(fold.clone());
        }

        let [relu1_2, relu2_2, relu3_3, relu4_3, relu5_3]: [Tensor<B, 4>; LEVELS] = levels
            .try_into()
            .unwrap_or_else(|_| unreachable!("Backbone is always built with {LEVELS} stages"));

        VggFeatures {
            relu1_2,
            relu2_2,
            relu3_3,
            relu4_3,
            relu5_3,
        }
    }

    /// Every convolution with its (1-based stage, torchvision `features` index).
    pub(crate) fn convs_mut(&mut self) -> Vec<(usize, usize, &mut Conv2d<B>)> {
        self.stages
            .iter_mut()
            .flat_map(|stage| stage.convs.iter_mut())
            .zip(torchvision_layout())
            .map(|(conv, (stage, _, index))| (stage + 1, index, &mut conv.conv))
            .collect()
    }
}

/// `(stage, conv within stage, torchvision features index)` of every convolution.
///
/// torchvision numbers conv, relu and pool layers alike, so a conv sits
/// two slots after the previous one and each pool takes up one slot.
pub fn torchvision_layout() -> Vec<(usize, usize, usize)> {
    let mut index = 0;
    let mut res = vec![];
    for (stage, &num_convs) in STAGE_CONVS.iter().enumerate() {
        if stage > 0 {
            index += 1;
        }
        for conv in 0..num_convs {
            res.push((stage, conv, index));
            index += 2;
        }
    }
    res
}

#[derive(Config, Debug)]
pub struct VggBackboneConfig {}

impl VggBackboneConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> VggBackbone<B> {
        let mut in_channels = 3;
        let mut stages = Vec::with_capacity(STAGE_CONVS.len());
        for (s, &num_convs) in STAGE_CONVS.iter().enumerate() {
            let out_channels = LEVEL_CHANNELS[s];
            let pooled = s > 0;
            let stage = VggStageConfig::new(num_convs, in_channels, out_channels, pooled);
            stages.push(stage.init(device));
            in_channels = out_channels;
        }

        VggBackbone { stages }
    }
}

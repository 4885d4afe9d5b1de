#![recursion_limit = "256"]

pub mod backbone;
pub mod checkpoint;
pub mod comparator;
pub mod normalize;
pub mod weights;

#[cfg(test)]
mod tests;

use backbone::{LEVEL_CHANNELS, LEVELS, TOTAL_DOWNSAMPLING, VggBackbone, VggBackboneConfig};
use burn::prelude::ElementConversion;
use burn::{
    config::Config,
    module::{Ignored, Module},
    tensor::{Tensor, backend::Backend},
};
use checkpoint::{Checkpoint, CheckpointError, KeyReport, ParamLoader};
use comparator::{ScaleComparator, ScaleComparatorConfig};
use normalize::{ChannelNorm, spatial_average};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use weights::{HttpFetcher, InitError, WeightFetcher, WeightSource};

/// Per-channel statistics the VGG backbone was trained with: `(x - shift) / scale`.
const SHIFT: [f32; 3] = [-0.030, -0.088, -0.188];
const SCALE: [f32; 3] = [0.458, 0.448, 0.450];

/// Slack allowed on the range check, to not trip over resampling overshoot.
const RANGE_TOLERANCE: f32 = 1e-3;

/// Value range of the images handed to [`LpipsModel::forward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputRange {
    /// Images in [0, 1], mapped to [-1, 1] before comparing.
    ZeroOne,
    /// Images in [-1, 1], what the scaling constants were calibrated for.
    MinusOneOne,
}

impl InputRange {
    fn bounds(self) -> (f32, f32) {
        match self {
            Self::ZeroOne => (0.0, 1.0),
            Self::MinusOneOne => (-1.0, 1.0),
        }
    }
}

#[derive(Debug, Error)]
pub enum LpipsError {
    #[error("Failed to initialize LPIPS weights")]
    Init(#[from] InitError),
    #[error("Images must have the same shape, got {a:?} and {b:?}")]
    ShapeMismatch { a: [usize; 4], b: [usize; 4] },
    #[error("Expected RGB images with 3 channels, got {0}")]
    ChannelCount(usize),
    #[error("Images of {height}x{width} are too small, need at least {min}x{min}")]
    TooSmall {
        height: usize,
        width: usize,
        min: usize,
    },
    #[error("Heads expect channels {found:?}, the backbone produces {expected:?}")]
    HeadMismatch {
        expected: [usize; LEVELS],
        found: Vec<usize>,
    },
    #[error("Image values span [{min}, {max}], outside the expected {range:?} range")]
    InputRange {
        min: f32,
        max: f32,
        range: InputRange,
    },
}

#[derive(Config, Debug)]
pub struct LpipsModelConfig {
    /// Dropout in front of the per-level heads, for training them. Only active on autodiff
    /// backends. [`load_lpips`] always turns it off.
    #[config(default = true)]
    pub dropout: bool,
    #[config(default = "InputRange::MinusOneOne")]
    pub input_range: InputRange,
    /// Reject images with values outside `input_range`. Costs a device readback per call.
    #[config(default = true)]
    pub check_range: bool,
    #[config(default = 1e-10)]
    pub epsilon: f64,
}

impl LpipsModelConfig {
    /// A model with freshly initialized (untrained) weights. See [`load_lpips`] for the real thing.
    pub fn init<B: Backend>(&self, device: &B::Device) -> LpipsModel<B> {
        let heads = LEVEL_CHANNELS
            .iter()
            .map(|&channels| {
                ScaleComparatorConfig::new(channels)
                    .with_dropout(self.dropout)
                    .init(device)
            })
            .collect();

        LpipsModel {
            backbone: VggBackboneConfig::new().init(device),
            heads,
            norm: ChannelNorm::new(self.epsilon),
            input_range: Ignored(self.input_range),
            check_range: self.check_range,
        }
    }

    /// Assemble a model from an already loaded backbone and heads.
    pub fn init_from_parts<B: Backend>(
        &self,
        backbone: VggBackbone<B>,
        heads: Vec<ScaleComparator<B>>,
    ) -> Result<LpipsModel<B>, LpipsError> {
        let found: Vec<usize> = heads.iter().map(ScaleComparator::channels).collect();
        if found != LEVEL_CHANNELS {
            return Err(LpipsError::HeadMismatch {
                expected: LEVEL_CHANNELS,
                found,
            });
        }

        Ok(LpipsModel {
            backbone,
            heads,
            norm: ChannelNorm::new(self.epsilon),
            input_range: Ignored(self.input_range),
            check_range: self.check_range,
        })
    }
}

/// Learned perceptual image patch similarity on a VGG16 backbone.
#[derive(Module, Debug)]
pub struct LpipsModel<B: Backend> {
    backbone: VggBackbone<B>,
    /// One head per backbone level, level-ascending.
    heads: Vec<ScaleComparator<B>>,
    norm: ChannelNorm,
    input_range: Ignored<InputRange>,
    check_range: bool,
}

impl<B: Backend> LpipsModel<B> {
    /// Per-level activations of the backbone, for images already in backbone space.
    pub fn features(&self, imgs: Tensor<B, 4>) -> [Tensor<B, 4>; LEVELS] {
        self.backbone.forward(imgs).into_levels()
    }

    /// Perceptual distance between two NCHW image batches, shape `[batch, 1, 1, 1]`.
    pub fn forward(
        &self,
        imgs_a: Tensor<B, 4>,
        imgs_b: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, LpipsError> {
        self.validate(&imgs_a, &imgs_b)?;
        let _span = tracing::trace_span!("LPIPS").entered();

        let [batch, ..] = imgs_a.dims();
        let device = imgs_a.device();

        // TODO: concatenating first might be faster.
        let levels_a = self.features(self.scale_inputs(imgs_a));
        let levels_b = self.features(self.scale_inputs(imgs_b));

        // Sum the levels, finest first.
        let mut total = Tensor::zeros([batch, 1, 1, 1], &device);
        for ((a, b), head) in levels_a.into_iter().zip(levels_b).zip(&self.heads) {
            let diff = self.norm.forward(a) - self.norm.forward(b);
            total = total + spatial_average(head.forward(diff.powi_scalar(2)));
        }
        Ok(total)
    }

    /// Like [`Self::forward`] but flattened to one value per batch element.
    pub fn distance(
        &self,
        imgs_a: Tensor<B, 4>,
        imgs_b: Tensor<B, 4>,
    ) -> Result<Tensor<B, 1>, LpipsError> {
        let [batch, _, _, _] = imgs_a.dims();
        Ok(self.forward(imgs_a, imgs_b)?.reshape([batch]))
    }

    fn scale_inputs(&self, imgs: Tensor<B, 4>) -> Tensor<B, 4> {
        let imgs = match self.input_range.0 {
            InputRange::ZeroOne => imgs * 2.0 - 1.0,
            InputRange::MinusOneOne => imgs,
        };
        let device = imgs.device();
        let shift = Tensor::<B, 1>::from_floats(SHIFT, &device).reshape([1, 3, 1, 1]);
        let scale = Tensor::<B, 1>::from_floats(SCALE, &device).reshape([1, 3, 1, 1]);
        (imgs - shift) / scale
    }

    fn validate(&self, imgs_a: &Tensor<B, 4>, imgs_b: &Tensor<B, 4>) -> Result<(), LpipsError> {
        let (a, b) = (imgs_a.dims(), imgs_b.dims());
        if a != b {
            return Err(LpipsError::ShapeMismatch { a, b });
        }
        let [_, channels, height, width] = a;
        if channels != 3 {
            return Err(LpipsError::ChannelCount(channels));
        }
        if height < TOTAL_DOWNSAMPLING || width < TOTAL_DOWNSAMPLING {
            return Err(LpipsError::TooSmall {
                height,
                width,
                min: TOTAL_DOWNSAMPLING,
            });
        }

        if self.check_range {
            let range = self.input_range.0;
            let (lo, hi) = range.bounds();
            for imgs in [imgs_a, imgs_b] {
                let min = imgs.clone().min().into_scalar().elem::<f32>();
                let max = imgs.clone().max().into_scalar().elem::<f32>();
                // NaN slips through the bound comparisons.
                let nans = imgs.clone().is_nan().int().sum();
                let nans = nans.into_scalar().elem::<i64>();
                if nans > 0 || min < lo - RANGE_TOLERANCE || max > hi + RANGE_TOLERANCE {
                    return Err(LpipsError::InputRange { min, max, range });
                }
            }
        }
        Ok(())
    }

    /// Copy every parameter `checkpoint` has a (shape-compatible) entry for into the model.
    ///
    /// Unknown entries are skipped and missing ones keep their current values; both end up
    /// in the returned report. An entry with the wrong shape is an error.
    pub fn load_checkpoint(
        mut self,
        checkpoint: &Checkpoint,
        device: &B::Device,
    ) -> Result<(Self, KeyReport), CheckpointError> {
        let mut loader = ParamLoader::new(checkpoint, device);

        for (stage, index, conv) in self.backbone.convs_mut() {
            let canonical = format!("net.slice{stage}.{index}");
            let prefixes = [canonical, format!("features.{index}")];
            loader.load_conv(conv, &prefixes)?;
        }

        for (level, head) in self.heads.iter_mut().enumerate() {
            // `model.1` with dropout in front of the conv, `model.0` without.
            let prefixes = [format!("lin{level}.model.1"), format!("lin{level}.model.0")];
            loader.load_conv(&mut head.conv, &prefixes)?;
        }

        Ok((self, loader.finish()))
    }

    /// Export every parameter under its canonical name.
    pub fn to_checkpoint(&self) -> Checkpoint {
        let mut checkpoint = Checkpoint::new();

        // convs_mut needs a mutable model; work on a (cheap, shared-storage) copy.
        let mut backbone = self.backbone.clone();
        for (stage, index, conv) in backbone.convs_mut() {
            let name = format!("net.slice{stage}.{index}.weight");
            checkpoint.insert(name, conv.weight.val());
            if let Some(bias) = &conv.bias {
                checkpoint.insert(format!("net.slice{stage}.{index}.bias"), bias.val());
            }
        }
        for (level, head) in self.heads.iter().enumerate() {
            checkpoint.insert(format!("lin{level}.model.1.weight"), head.conv.weight.val());
        }
        checkpoint
    }
}

/// How to obtain trained LPIPS weights.
#[derive(Config, Debug)]
pub struct LpipsLoadConfig {
    /// Checkpoint with the per-level heads, and possibly the backbone as well.
    pub weights: WeightSource,
    /// Separately distributed backbone weights, applied before `weights`.
    pub backbone: Option<WeightSource>,
    /// Fail instead of warning when the checkpoints leave model parameters unset.
    #[config(default = false)]
    pub strict: bool,
    #[config(default = "LpipsModelConfig::new()")]
    pub model: LpipsModelConfig,
}

/// Build a frozen LPIPS model, downloading weights over HTTP if they aren't cached yet.
pub async fn load_lpips<B: Backend>(
    config: &LpipsLoadConfig,
    device: &B::Device,
) -> Result<LpipsModel<B>, LpipsError> {
    load_lpips_with(config, &HttpFetcher, device).await
}

/// [`load_lpips`] with a custom download mechanism.
pub async fn load_lpips_with<B: Backend>(
    config: &LpipsLoadConfig,
    fetcher: &impl WeightFetcher,
    device: &B::Device,
) -> Result<LpipsModel<B>, LpipsError> {
    // Loaded weights are frozen, dropout would make the metric stochastic on autodiff backends.
    let mut model = config.model.clone().with_dropout(false).init::<B>(device);
    let mut report: Option<KeyReport> = None;

    let sources = config.backbone.iter().chain([&config.weights]);
    for source in sources {
        let checkpoint = source.acquire(fetcher).await?;
        let loaded = model.load_checkpoint(&checkpoint, device);
        let (loaded, source_report) = loaded.map_err(|e| InitError::Incompatible {
            path: source.path.clone(),
            source: e,
        })?;
        model = loaded;
        source_report.log(&format!("LPIPS ({:?})", source.path));
        report = Some(match report {
            Some(prev) => merge_reports(prev, source_report),
            None => source_report,
        });
    }
    let report = report.unwrap_or_default();

    if config.strict && !report.missing.is_empty() {
        return Err(InitError::Incompatible {
            path: config.weights.path.clone(),
            source: CheckpointError::MissingKeys(report.missing.into_iter().collect()),
        }
        .into());
    }

    Ok(model.no_grad())
}

/// A parameter counts as missing only if no checkpoint provided it.
fn merge_reports(a: KeyReport, b: KeyReport) -> KeyReport {
    let matched = a.matched.union(&b.matched).cloned().collect();
    let missing = a.missing.intersection(&b.missing).cloned().collect();
    let unexpected = a.unexpected.union(&b.unexpected).cloned().collect();
    KeyReport {
        matched,
        missing,
        unexpected,
    }
}

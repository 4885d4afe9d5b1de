#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::module::Module;
use burn::record::{FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use clap::Parser;
use lpips::LpipsModelConfig;
use lpips::backbone::{LEVEL_CHANNELS, VggBackbone, VggBackboneConfig, torchvision_layout};
use lpips::comparator::{ScaleComparator, ScaleComparatorConfig};

type ConvertBackend = burn::backend::NdArray;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Convert PyTorch LPIPS weights to a safetensors checkpoint"
)]
struct Args {
    /// State dict of the LPIPS heads (`lin0` .. `lin4`), e.g. `weights/v0.1/vgg.pth`.
    #[arg(long)]
    lpips: PathBuf,

    /// torchvision VGG16 state dict. Without it only the heads are converted.
    #[arg(long)]
    backbone: Option<PathBuf>,

    /// Where to write the safetensors checkpoint.
    #[arg(long)]
    output: PathBuf,
}

fn recorder() -> PyTorchFileRecorder<FullPrecisionSettings> {
    PyTorchFileRecorder::<FullPrecisionSettings>::default()
}

fn load_heads<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> anyhow::Result<Vec<ScaleComparator<B>>> {
    let mut heads = Vec::with_capacity(LEVEL_CHANNELS.len());
    for (level, &channels) in LEVEL_CHANNELS.iter().enumerate() {
        // Older checkpoints have no dropout in front of the conv, and call it `model.0`.
        let pattern = format!(r"^lin{level}\.model\.[01]\.weight$");
        let args = LoadArgs::new(path.to_path_buf()).with_key_remap(&pattern, "conv.weight");
        let record: <ScaleComparator<B> as Module<B>>::Record = recorder()
            .load(args, device)
            .with_context(|| format!("Failed to read head {level} from {path:?}"))?;
        let head = ScaleComparatorConfig::new(channels).init(device);
        heads.push(head.load_record(record));
    }
    Ok(heads)
}

fn load_backbone<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> anyhow::Result<VggBackbone<B>> {
    let mut args = LoadArgs::new(path.to_path_buf());
    for (stage, conv, index) in torchvision_layout() {
        let slice = stage + 1;
        args = args.with_key_remap(
            &format!(r"^(?:features|net\.slice{slice})\.{index}\.(weight|bias)$"),
            &format!("stages.{stage}.convs.{conv}.conv.$1"),
        );
    }
    let record: <VggBackbone<B> as Module<B>>::Record = recorder()
        .load(args, device)
        .with_context(|| format!("Failed to read backbone from {path:?}"))?;
    Ok(VggBackboneConfig::new().init(device).load_record(record))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .target(env_logger::Target::Stdout)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let device = Default::default();

    log::info!("Reading LPIPS heads from {:?}", args.lpips);
    let heads = load_heads::<ConvertBackend>(&args.lpips, &device)?;

    let backbone = match &args.backbone {
        Some(path) => {
            log::info!("Reading VGG16 backbone from {path:?}");
            Some(load_backbone::<ConvertBackend>(path, &device)?)
        }
        None => {
            log::warn!("No backbone given, only the heads will be converted");
            None
        }
    };
    let has_backbone = backbone.is_some();

    let model = LpipsModelConfig::new().init_from_parts(
        backbone.unwrap_or_else(|| VggBackboneConfig::new().init(&device)),
        heads,
    )?;

    let mut checkpoint = model.to_checkpoint();
    if !has_backbone {
        // Don't ship randomly initialized backbone weights.
        checkpoint.retain(|name| name.starts_with("lin"));
    }

    checkpoint
        .write(&args.output)
        .await
        .with_context(|| format!("Failed to write {:?}", args.output))?;

    log::info!("Wrote {} tensors to {:?}", checkpoint.len(), args.output);
    Ok(())
}

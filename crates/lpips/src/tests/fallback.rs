use std::cell::Cell;
use std::path::PathBuf;

use super::{TestBackend, uniform_heads};
use crate::checkpoint::{Checkpoint, CheckpointError, write_file};
use crate::weights::{FetchError, InitError, WeightFetcher, WeightSource};
use crate::{LpipsError, LpipsLoadConfig, LpipsModelConfig, load_lpips_with};
use assert_approx_eq::assert_approx_eq;
use burn::backend::{Autodiff, NdArray};
use burn::tensor::{Distribution, Tensor};
use tempfile::TempDir;

/// Serves a fixed payload (or an error) and counts how often it was asked.
struct CountingFetcher {
    payload: Option<Vec<u8>>,
    calls: Cell<usize>,
}

impl CountingFetcher {
    fn serving(payload: Vec<u8>) -> Self {
        Self {
            payload: Some(payload),
            calls: Cell::new(0),
        }
    }

    fn offline() -> Self {
        Self {
            payload: None,
            calls: Cell::new(0),
        }
    }
}

impl WeightFetcher for CountingFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.set(self.calls.get() + 1);
        self.payload
            .clone()
            .ok_or_else(|| FetchError::Other(format!("offline, can't reach {url}")))
    }
}

/// A not yet existing checkpoint path, inside a directory that lives as long as the guard.
fn scratch() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("Create temp dir");
    let path = dir.path().join("weights").join("lpips_vgg.safetensors");
    (dir, path)
}

fn heads_bytes() -> Vec<u8> {
    uniform_heads(&Default::default())
        .to_bytes()
        .expect("Serialize failed")
}

fn load_config(path: PathBuf) -> LpipsLoadConfig {
    LpipsLoadConfig::new(WeightSource::new(
        path,
        "https://weights.invalid/lpips_vgg.safetensors".to_owned(),
    ))
}

#[tokio::test]
async fn missing_checkpoint_is_fetched_once_and_cached() {
    let device = Default::default();
    let (_dir, path) = scratch();
    let config = load_config(path.clone());

    let fetcher = CountingFetcher::serving(heads_bytes());
    load_lpips_with::<TestBackend>(&config, &fetcher, &device)
        .await
        .expect("Fallback should succeed");
    assert_eq!(fetcher.calls.get(), 1, "Exactly one download");
    assert!(path.is_file(), "Download should be cached at {path:?}");

    // Second construction must not touch the network.
    let offline = CountingFetcher::offline();
    load_lpips_with::<TestBackend>(&config, &offline, &device)
        .await
        .expect("Cached weights should load");
    assert_eq!(offline.calls.get(), 0, "Cached weights need no download");
}

#[tokio::test]
async fn fetched_weights_end_up_in_the_model() {
    let device = Default::default();
    let (_dir, path) = scratch();
    let config = load_config(path);

    let fetcher = CountingFetcher::serving(heads_bytes());
    let model = load_lpips_with::<TestBackend>(&config, &fetcher, &device)
        .await
        .expect("Fallback should succeed");

    let exported = model.to_checkpoint();
    let head = exported.get("lin2.model.1.weight").expect("Head exported");
    for v in head.to_vec::<f32>().expect("Wrong type") {
        assert_approx_eq!(v, 1.0 / 256.0, 1e-7);
    }
}

#[tokio::test]
async fn corrupt_checkpoint_is_replaced() {
    let device = Default::default();
    let (_dir, path) = scratch();
    write_file(&path, b"definitely not safetensors")
        .await
        .expect("Write failed");

    let fetcher = CountingFetcher::serving(heads_bytes());
    load_lpips_with::<TestBackend>(&load_config(path.clone()), &fetcher, &device)
        .await
        .expect("Fallback should succeed");

    assert_eq!(fetcher.calls.get(), 1, "Exactly one download");
    let cached = Checkpoint::read(&path).await.expect("Cache should now parse");
    assert_eq!(cached.len(), 5);
}

#[tokio::test]
async fn unreachable_remote_is_fatal() {
    let device = Default::default();
    let (_dir, path) = scratch();
    let fetcher = CountingFetcher::offline();

    let res = load_lpips_with::<TestBackend>(&load_config(path), &fetcher, &device).await;

    assert!(matches!(
        res,
        Err(LpipsError::Init(InitError::Fetch { .. }))
    ));
    assert_eq!(
        fetcher.calls.get(),
        1,
        "No retries beyond the single fallback"
    );
}

#[tokio::test]
async fn unparsable_download_is_fatal() {
    let device = Default::default();
    let (_dir, path) = scratch();
    let fetcher = CountingFetcher::serving(b"<!DOCTYPE html><p>gone</p>".to_vec());

    let res = load_lpips_with::<TestBackend>(&load_config(path), &fetcher, &device).await;

    assert!(matches!(res, Err(LpipsError::Init(InitError::Load { .. }))));
    assert_eq!(
        fetcher.calls.get(),
        1,
        "Second read failure must not download again"
    );
}

#[tokio::test]
async fn wrong_shapes_are_incompatible() {
    let device = Default::default();
    let mut checkpoint = Checkpoint::new();
    checkpoint.insert(
        "lin0.model.1.weight",
        Tensor::<TestBackend, 4>::ones([1, 32, 1, 1], &device),
    );
    let fetcher = CountingFetcher::serving(checkpoint.to_bytes().expect("Serialize failed"));
    let (_dir, path) = scratch();

    let res = load_lpips_with::<TestBackend>(&load_config(path), &fetcher, &device).await;

    assert!(matches!(
        res,
        Err(LpipsError::Init(InitError::Incompatible {
            source: CheckpointError::Shape { .. },
            ..
        }))
    ));
}

#[tokio::test]
async fn strict_mode_requires_every_parameter() {
    let device = Default::default();
    let fetcher = CountingFetcher::serving(heads_bytes());
    let (_dir, path) = scratch();
    let config = load_config(path).with_strict(true);

    // Heads only, so the backbone is missing.
    let res = load_lpips_with::<TestBackend>(&config, &fetcher, &device).await;
    assert!(matches!(
        res,
        Err(LpipsError::Init(InitError::Incompatible {
            source: CheckpointError::MissingKeys(_),
            ..
        }))
    ));
}

#[tokio::test]
async fn separate_backbone_source() {
    let device = Default::default();

    // torchvision naming: `features.{index}.weight`.
    let mut reference = LpipsModelConfig::new().init::<TestBackend>(&device);
    let mut backbone = Checkpoint::new();
    for (_, index, conv) in reference.backbone.convs_mut() {
        backbone.insert(format!("features.{index}.weight"), conv.weight.val());
        if let Some(bias) = &conv.bias {
            backbone.insert(format!("features.{index}.bias"), bias.val());
        }
    }
    // torchvision also ships the classifier, which LPIPS doesn't use.
    backbone.insert(
        "classifier.6.bias",
        Tensor::<TestBackend, 1>::zeros([1000], &device),
    );

    let (dir, heads_path) = scratch();
    let backbone_path = dir.path().join("vgg16.safetensors");
    backbone.write(&backbone_path).await.expect("Write failed");
    uniform_heads(&device)
        .write(&heads_path)
        .await
        .expect("Write failed");

    let config = load_config(heads_path)
        .with_backbone(Some(WeightSource::new(
            backbone_path,
            "https://weights.invalid/vgg16.safetensors".to_owned(),
        )))
        .with_strict(true);

    let fetcher = CountingFetcher::offline();
    let model = load_lpips_with::<TestBackend>(&config, &fetcher, &device)
        .await
        .expect("Backbone and heads together cover every parameter");
    assert_eq!(fetcher.calls.get(), 0);

    let loaded = model.to_checkpoint();
    let expected = backbone.get("features.28.weight").expect("Present");
    let got = loaded.get("net.slice5.28.weight").expect("Exported");
    assert_eq!(got.shape, expected.shape);
    let (got, expected) = (
        got.to_vec::<f32>().expect("Wrong type"),
        expected.to_vec::<f32>().expect("Wrong type"),
    );
    for (a, b) in got.into_iter().zip(expected) {
        assert_approx_eq!(a, b, 1e-7);
    }
}

#[tokio::test]
async fn loaded_metric_is_deterministic_when_differentiable() {
    type TrainBackend = Autodiff<NdArray>;

    let device = Default::default();
    let (_dir, path) = scratch();
    uniform_heads(&device)
        .write(&path)
        .await
        .expect("Write failed");

    // The stored config asks for dropout, loading must still turn it off.
    let model_config = LpipsModelConfig::new().with_dropout(true);
    let config = load_config(path).with_model(model_config);
    let fetcher = CountingFetcher::offline();
    let model = load_lpips_with::<TrainBackend>(&config, &fetcher, &device)
        .await
        .expect("Cached weights should load");

    let dist = Distribution::Uniform(-1.0, 1.0);
    let a = Tensor::<TrainBackend, 4>::random([2, 3, 32, 32], dist, &device);
    let b = Tensor::<TrainBackend, 4>::random([2, 3, 32, 32], dist, &device);

    let first = model.distance(a.clone(), b.clone()).expect("Valid input");
    let second = model.distance(a.clone(), b.clone()).expect("Valid input");
    let swapped = model.distance(b, a).expect("Valid input");

    let first = first.into_data().to_vec::<f32>().expect("Wrong type");
    let second = second.into_data().to_vec::<f32>().expect("Wrong type");
    let swapped = swapped.into_data().to_vec::<f32>().expect("Wrong type");
    for ((x, y), z) in first.into_iter().zip(second).zip(swapped) {
        assert_approx_eq!(x, y, 1e-6);
        assert_approx_eq!(x, z, 1e-5);
    }
}

use crate::LpipsModel;
use crate::backbone::LEVEL_CHANNELS;
use crate::checkpoint::Checkpoint;
use burn::backend::NdArray;
use burn::module::Module;
use burn::tensor::{Distribution, Tensor};

mod fallback;

type TestBackend = NdArray;

/// Heads that weigh every channel equally, like a trained (non-negative) checkpoint would.
fn uniform_heads(device: &<TestBackend as burn::tensor::backend::Backend>::Device) -> Checkpoint {
    let mut checkpoint = Checkpoint::new();
    for (level, &channels) in LEVEL_CHANNELS.iter().enumerate() {
        checkpoint.insert(
            format!("lin{level}.model.1.weight"),
            Tensor::<TestBackend, 4>::full([1, channels, 1, 1], 1.0 / channels as f32, device),
        );
    }
    checkpoint
}

fn random_images(batch: usize, size: usize) -> Tensor<TestBackend, 4> {
    Tensor::random(
        [batch, 3, size, size],
        Distribution::Uniform(-1.0, 1.0),
        &Default::default(),
    )
}

fn test_model() -> LpipsModel<TestBackend> {
    let device = Default::default();
    let (model, report) = crate::LpipsModelConfig::new()
        .init::<TestBackend>(&device)
        .load_checkpoint(&uniform_heads(&device), &device)
        .expect("Heads should load");
    assert_eq!(report.matched.len(), LEVEL_CHANNELS.len(), "All heads should match");
    model.no_grad()
}

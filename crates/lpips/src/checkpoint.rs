//! Flat `name -> array` parameter files, stored as safetensors.
//!
//! Parameter names follow the PyTorch LPIPS state dict so a checkpoint saved from
//! `lpips.LPIPS(net='vgg').state_dict()` with `safetensors.torch.save_file` loads as is.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use burn::module::Param;
use burn::nn::conv::Conv2d;
use burn::tensor::{Tensor, TensorData, backend::Backend, bf16, f16};
use safetensors::tensor::{Dtype, SafeTensorError, SafeTensors, TensorView};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error while accessing checkpoint.")]
    Io(#[from] std::io::Error),
    #[error("Invalid safetensors data: {0}")]
    Format(#[from] SafeTensorError),
    #[error("Tensor {name} has unsupported element type {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },
    #[error("Tensor {name} has shape {found:?}, expected {expected:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("Checkpoint is missing {count} parameters: {0:?}", count = .0.len())]
    MissingKeys(Vec<String>),
}

/// An in-memory parameter file.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    tensors: HashMap<String, TensorData>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let file = SafeTensors::deserialize(bytes)?;
        let tensors = file
            .tensors()
            .into_iter()
            .map(|(name, view)| {
                let data = view_to_data(&name, &view)?;
                Ok((name, data))
            })
            .collect::<Result<_, CheckpointError>>()?;
        Ok(Self { tensors })
    }

    pub async fn read(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = tokio::fs::read(path).await?;
        Self::from_bytes(&bytes)
    }

    /// Serialize as safetensors. Everything is stored as f32.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        let mut buffers = Vec::with_capacity(self.tensors.len());
        for (name, data) in &self.tensors {
            let values = data
                .clone()
                .convert::<f32>()
                .to_vec::<f32>()
                .unwrap_or_else(|_| unreachable!("Data was just converted to f32"));
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            buffers.push((name.as_str(), data.shape.clone(), bytes));
        }

        let mut views = Vec::with_capacity(buffers.len());
        for (name, shape, bytes) in &buffers {
            views.push((*name, TensorView::new(Dtype::F32, shape.clone(), bytes)?));
        }

        Ok(safetensors::serialize(views, None)?)
    }

    pub async fn write(&self, path: &Path) -> Result<(), CheckpointError> {
        write_file(path, &self.to_bytes()?).await?;
        Ok(())
    }

    pub fn insert<B: Backend, const D: usize>(
        &mut self,
        name: impl Into<String>,
        tensor: Tensor<B, D>,
    ) {
        self.tensors.insert(name.into(), tensor.into_data());
    }

    /// Drop every entry `keep` returns false for.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.tensors.retain(|name, _| keep(name));
    }

    pub fn get(&self, name: &str) -> Option<&TensorData> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}

/// Write `bytes` to `path`, creating missing parent directories.
pub async fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await
}

fn view_to_data(name: &str, view: &TensorView<'_>) -> Result<TensorData, CheckpointError> {
    let bytes = view.data();
    let values: Vec<f32> = match view.dtype() {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::F64 => bytes
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                f64::from_le_bytes(b) as f32
            })
            .collect(),
        dtype => {
            return Err(CheckpointError::UnsupportedDtype {
                name: name.to_owned(),
                dtype,
            });
        }
    };
    Ok(TensorData::new(values, view.shape().to_vec()))
}

/// Which checkpoint entries ended up in the model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyReport {
    pub matched: BTreeSet<String>,
    /// Model parameters the checkpoint had no entry for. These keep their previous values.
    pub missing: BTreeSet<String>,
    /// Checkpoint entries no model parameter asked for.
    pub unexpected: BTreeSet<String>,
}

impl KeyReport {
    pub fn log(&self, what: &str) {
        log::info!("Loaded {} parameters into {what}", self.matched.len());
        if !self.missing.is_empty() {
            log::warn!(
                "{what}: {} parameters not found in checkpoint, keeping initial values: {:?}",
                self.missing.len(),
                self.missing
            );
        }
        if !self.unexpected.is_empty() {
            log::warn!(
                "{what}: ignoring {} unused checkpoint entries: {:?}",
                self.unexpected.len(),
                self.unexpected
            );
        }
    }
}

/// Copies tensors out of a checkpoint into module parameters, keeping track of what matched.
pub(crate) struct ParamLoader<'a, B: Backend> {
    checkpoint: &'a Checkpoint,
    device: &'a B::Device,
    report: KeyReport,
}

impl<'a, B: Backend> ParamLoader<'a, B> {
    pub(crate) fn new(checkpoint: &'a Checkpoint, device: &'a B::Device) -> Self {
        Self {
            checkpoint,
            device,
            report: KeyReport::default(),
        }
    }

    /// Look up the first of `names` present in the checkpoint. The first name is the canonical one
    /// and is what gets reported when none match.
    fn tensor<const D: usize>(
        &mut self,
        names: &[String],
        expected: [usize; D],
    ) -> Result<Option<Tensor<B, D>>, CheckpointError> {
        let checkpoint = self.checkpoint;
        let found = names.iter().find_map(|n| checkpoint.get(n).map(|d| (n, d)));
        let Some((name, data)) = found else {
            self.report.missing.insert(names[0].clone());
            return Ok(None);
        };

        if data.shape != expected {
            return Err(CheckpointError::Shape {
                name: name.clone(),
                expected: expected.to_vec(),
                found: data.shape.clone(),
            });
        }

        self.report.matched.insert(name.clone());
        Ok(Some(Tensor::from_data(data.clone(), self.device)))
    }

    /// Load a conv's weight (and bias, if it has one) from `{prefix}.weight` / `{prefix}.bias`,
    /// trying each prefix in order.
    pub(crate) fn load_conv(
        &mut self,
        conv: &mut Conv2d<B>,
        prefixes: &[String],
    ) -> Result<(), CheckpointError> {
        let names = |suffix: &str| -> Vec<String> {
            prefixes.iter().map(|p| format!("{p}.{suffix}")).collect()
        };

        if let Some(weight) = self.tensor(&names("weight"), conv.weight.val().dims())? {
            conv.weight = Param::from_tensor(weight);
        }

        let bias_dims = conv.bias.as_ref().map(|b| b.val().dims());
        if let Some(dims) = bias_dims
            && let Some(bias) = self.tensor(&names("bias"), dims)?
        {
            conv.bias = Some(Param::from_tensor(bias));
        }
        Ok(())
    }

    pub(crate) fn finish(mut self) -> KeyReport {
        let used: BTreeSet<&str> = self.report.matched.iter().map(String::as_str).collect();
        self.report.unexpected = self
            .checkpoint
            .keys()
            .filter(|k| !used.contains(k))
            .map(str::to_owned)
            .collect();
        self.report
    }
}

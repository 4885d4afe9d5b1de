#![recursion_limit = "256"]

//! Convolutional image autoencoder and a patch discriminator to train it against.

pub mod decoder;
pub mod discriminator;
pub mod encoder;
pub mod residual;

use burn::{
    config::Config,
    module::Module,
    tensor::{Tensor, backend::Backend},
};
use decoder::{ImageDecoder, ImageDecoderConfig};
use encoder::{ImageEncoder, ImageEncoderConfig};

/// Spatial reduction between an image and its latent.
pub const DOWNSAMPLING: usize = 8;

#[derive(Config, Debug)]
pub struct VaeConfig {
    #[config(default = 3)]
    pub image_channels: usize,
    #[config(default = 256)]
    pub latent_dim: usize,
    /// Scales the channel count of every hidden layer.
    #[config(default = 1.0)]
    pub width_mult: f64,
    #[config(default = 8)]
    pub groups: usize,
}

impl VaeConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Vae<B> {
        Vae {
            encoder: ImageEncoderConfig::new()
                .with_in_channels(self.image_channels)
                .with_latent_dim(self.latent_dim)
                .with_width_mult(self.width_mult)
                .with_groups(self.groups)
                .init(device),
            decoder: ImageDecoderConfig::new()
                .with_out_channels(self.image_channels)
                .with_latent_dim(self.latent_dim)
                .with_width_mult(self.width_mult)
                .with_groups(self.groups)
                .init(device),
        }
    }
}

/// Encoder and decoder pair. The latent is deterministic, there is no sampling step.
#[derive(Module, Debug)]
pub struct Vae<B: Backend> {
    pub encoder: ImageEncoder<B>,
    pub decoder: ImageDecoder<B>,
}

impl<B: Backend> Vae<B> {
    /// Returns `(reconstruction, latent)`.
    ///
    /// The reconstruction has the input's shape whenever height and width are
    /// multiples of [`DOWNSAMPLING`].
    pub fn forward(&self, images: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let latent = self.encoder.forward(images);
        let recon = self.decoder.forward(latent.clone());
        (recon, latent)
    }
}

/// Hidden width shared by encoder and decoder.
pub(crate) fn base_channels(width_mult: f64) -> usize {
    (64.0 * width_mult).floor() as usize
}

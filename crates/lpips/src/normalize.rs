use burn::{
    module::Module,
    tensor::{Tensor, backend::Backend},
};

/// Scales every channel vector of an activation map to unit length.
#[derive(Module, Clone, Debug)]
pub struct ChannelNorm {
    epsilon: f64,
}

impl ChannelNorm {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    /// `x / (||x||_c + eps)` for input of shape `[batch, channels, height, width]`.
    ///
    /// The epsilon keeps all-zero vectors at zero rather than dividing by zero.
    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let norm = x.clone().powi_scalar(2).sum_dim(1).sqrt();
        x / norm.add_scalar(self.epsilon)
    }
}

/// Mean over height and width, keeping the singleton dims: `[B, C, H, W] -> [B, C, 1, 1]`.
pub fn spatial_average<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.mean_dim(2).mean_dim(3)
}

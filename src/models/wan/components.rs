//! Capability traits for the collaborators the sampling pipeline drives.
//!
//! The transformer, the text encoder, the image encoder and the video
//! autoencoder are external; the pipeline only needs these narrow interfaces.

use crate::models::wan::packager::ModelInput;
use candle_core::{DType, Device, Result, Tensor};

/// Which memory pool a movable component currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Host,
    Compute,
}

/// A component whose weights can be moved between host and compute device.
pub trait Offload {
    fn component_name(&self) -> &str;

    fn residency(&self) -> Residency;

    /// Moves all weights to `device`, which is the pool named by `residency`.
    fn place(&mut self, residency: Residency, device: &Device) -> Result<()>;
}

/// Diffusion transformer: predicts the flow velocity for a batch of latents.
pub trait Predicts {
    fn dtype(&self) -> DType;

    fn device(&self) -> &Device;

    /// One prediction per entry of `input.latents`, each shaped like its latent.
    fn forward(&mut self, input: &ModelInput) -> Result<Vec<Tensor>>;
}

/// Output of the text encoder for a batch of prompts.
#[derive(Debug, Clone)]
pub struct TextEncoding {
    /// `[B, L, D]`
    pub embeds: Tensor,
    /// `[B, L]`, 1 for real tokens
    pub mask: Tensor,
}

impl TextEncoding {
    /// Embedding of prompt `index` with padding tokens dropped, `[len, D]`.
    pub fn trimmed(&self, index: usize) -> Result<Tensor> {
        let len = self
            .mask
            .get(index)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()? as usize;
        self.embeds.get(index)?.narrow(0, 0, len.max(1))
    }
}

pub trait EncodesText {
    fn encode(&mut self, prompts: &[String], device: &Device) -> Result<TextEncoding>;
}

/// Image embedding model (CLIP vision tower for I2V).
pub trait EncodesImage {
    /// `image`: `[3, 1, H, W]` in `[-1, 1]`. Returns the image feature tensor.
    fn encode_image(&mut self, image: &Tensor, device: &Device) -> Result<Tensor>;
}

/// Video autoencoder.
pub trait EncodesDecodes: Offload {
    /// `[3, F, H, W]` pixels in `[-1, 1]` to `[16, (F-1)/4+1, H/8, W/8]`.
    fn encode(&mut self, video: &Tensor) -> Result<Tensor>;

    /// `[B, 16, T, h, w]` latents to `[B, 3, (T-1)*4+1, h*8, w*8]` pixels in `[-1, 1]`.
    fn decode(&mut self, latents: &Tensor) -> Result<Tensor>;
}

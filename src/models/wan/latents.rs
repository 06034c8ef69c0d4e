//! Latent video shape derivation and the buffer that holds the evolving latent.

use crate::config::{ConfigError, InferenceConfig, LatentPlacement, NoiseLayout};
use crate::models::wan::configs::WanConfig;
use crate::utils::deterministic_rng::Pcg32;
use candle_core::{DType, Device, Result, Tensor};
use tracing::debug;

/// Geometry of a latent video, `[batch, channels, frames, height, width]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentShape {
    pub batch: usize,
    pub channels: usize,
    pub frames: usize,
    pub height: usize,
    pub width: usize,
}

impl LatentShape {
    /// Latent geometry for a `frame_count`-frame video of `height` x `width` pixels.
    pub fn for_video(
        frame_count: usize,
        height: usize,
        width: usize,
        config: &WanConfig,
    ) -> std::result::Result<Self, ConfigError> {
        let (stride_t, stride_h, stride_w) = config.vae_stride;
        if frame_count == 0 {
            return Err(ConfigError::InvalidFrameCount(frame_count));
        }
        let shape = Self {
            batch: 1,
            channels: config.latent_channels,
            frames: (frame_count - 1) / stride_t + 1,
            height: height / stride_h,
            width: width / stride_w,
        };
        let (_, patch_h, patch_w) = config.patch_size;
        if shape.height == 0
            || shape.width == 0
            || !shape.height.is_multiple_of(patch_h)
            || !shape.width.is_multiple_of(patch_w)
        {
            return Err(ConfigError::InvalidDimensions { height, width });
        }
        Ok(shape)
    }

    pub fn for_inference(
        inference: &InferenceConfig,
        config: &WanConfig,
    ) -> std::result::Result<Self, ConfigError> {
        Self::for_video(inference.frame_count, inference.height, inference.width, config)
    }

    pub fn dims(&self) -> (usize, usize, usize, usize, usize) {
        (self.batch, self.channels, self.frames, self.height, self.width)
    }

    /// Shape of one latent frame, `[batch, channels, 1, height, width]`.
    pub fn frame_dims(&self) -> (usize, usize, usize, usize, usize) {
        (self.batch, self.channels, 1, self.height, self.width)
    }

    /// Transformer tokens for one sample: `frames * h * w / (p_t * p_h * p_w)`.
    pub fn seq_len(&self, patch_size: (usize, usize, usize)) -> usize {
        let (pt, ph, pw) = patch_size;
        self.frames * self.height * self.width / (pt * ph * pw)
    }

    /// Pixel frame count the autoencoder produces when decoding this latent.
    pub fn pixel_frames(&self, temporal_stride: usize) -> usize {
        (self.frames - 1) * temporal_stride + 1
    }
}

/// Draws the initial Gaussian latent on the host, in `f32`.
pub fn initial_noise(shape: &LatentShape, rng: &mut Pcg32, layout: NoiseLayout) -> Result<Tensor> {
    match layout {
        NoiseLayout::Batched => rng.randn(shape.dims(), &Device::Cpu),
        NoiseLayout::PerFrame => {
            let frames = (0..shape.frames)
                .map(|_| rng.randn(shape.frame_dims(), &Device::Cpu))
                .collect::<Result<Vec<_>>>()?;
            Tensor::cat(&frames, 2)
        }
    }
}

/// Owns the evolving latent video between denoising steps.
#[derive(Debug)]
pub struct LatentBuffer {
    latent: Tensor,
    shape: LatentShape,
    placement: LatentPlacement,
    compute: Device,
}

impl LatentBuffer {
    pub fn init_noise(
        shape: LatentShape,
        rng: &mut Pcg32,
        layout: NoiseLayout,
        placement: LatentPlacement,
        compute: &Device,
    ) -> Result<Self> {
        let latent = initial_noise(&shape, rng, layout)?;
        debug!(dims = ?shape.dims(), ?layout, ?placement, "initial noise");
        Self::from_tensor(latent, placement, compute)
    }

    pub fn from_tensor(latent: Tensor, placement: LatentPlacement, compute: &Device) -> Result<Self> {
        let (batch, channels, frames, height, width) = latent.dims5()?;
        let latent = latent.to_dtype(DType::F32)?;
        let latent = match placement {
            LatentPlacement::Eager => latent.to_device(compute)?,
            LatentPlacement::Lazy => latent.to_device(&Device::Cpu)?,
        };
        Ok(Self {
            latent,
            shape: LatentShape {
                batch,
                channels,
                frames,
                height,
                width,
            },
            placement,
            compute: compute.clone(),
        })
    }

    pub fn shape(&self) -> &LatentShape {
        &self.shape
    }

    pub fn placement(&self) -> LatentPlacement {
        self.placement
    }

    /// Current latent where it is stored.
    pub fn current(&self) -> &Tensor {
        &self.latent
    }

    /// Whether the stored latent is in host memory between steps.
    pub fn is_host_resident(&self) -> bool {
        self.latent.device().is_cpu()
    }

    /// Copy of the latent on the compute device, cast to the transformer dtype.
    pub fn for_forward(&self, dtype: DType) -> Result<Tensor> {
        self.latent.to_device(&self.compute)?.to_dtype(dtype)
    }

    /// Stores the scheduler output, keeping the configured placement.
    pub fn replace(&mut self, next: Tensor) -> Result<()> {
        if next.dims() != self.latent.dims() {
            candle_core::bail!(
                "latent shape changed during denoising: {:?} -> {:?}",
                self.latent.dims(),
                next.dims()
            );
        }
        let next = next.to_dtype(DType::F32)?;
        self.latent = match self.placement {
            LatentPlacement::Eager => next.to_device(&self.compute)?,
            LatentPlacement::Lazy => next.to_device(&Device::Cpu)?,
        };
        Ok(())
    }

    pub fn into_inner(self) -> Tensor {
        self.latent
    }
}

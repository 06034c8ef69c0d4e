//! Text and image conditioning for one sampling batch.
//!
//! The assembler owns the encoders, so nothing else can invoke them, and a
//! batch-scoped cache keyed by prompt string and image path. Entries are
//! write-once: the first encode of a key wins for the rest of the batch.

use crate::config::{ConfigError, InferenceConfig};
use crate::models::wan::components::{EncodesDecodes, EncodesImage, EncodesText};
use crate::models::wan::configs::WanConfig;
use crate::models::wan::latents::LatentShape;
use crate::models::wan::placement::{DevicePlacement, PlacementError};
use crate::utils::image::{ImageLoadError, load_conditioning_image};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ConditioningError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Image(#[from] ImageLoadError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ConditioningError>;

/// What a single sample is conditioned on.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub image_path: Option<PathBuf>,
}

/// Immutable conditioning for one sample, shared by every step and both passes.
#[derive(Debug, Clone)]
pub struct ConditioningBundle {
    /// `[L, D]` on the compute device, transformer dtype
    pub context: Tensor,
    pub context_null: Option<Tensor>,
    pub seq_len: usize,
    pub clip_fea: Option<Tensor>,
    /// `[1, 4 + 16, T, h, w]`
    pub y: Option<Tensor>,
}

/// Encoder outputs for the current batch, held on the host.
#[derive(Debug, Default)]
pub struct EncoderCache {
    text: HashMap<String, Tensor>,
    images: HashMap<PathBuf, Tensor>,
    text_encodes: usize,
    image_encodes: usize,
}

impl EncoderCache {
    pub fn text(&self, prompt: &str) -> Option<&Tensor> {
        self.text.get(prompt)
    }

    pub fn image(&self, path: &Path) -> Option<&Tensor> {
        self.images.get(path)
    }

    /// Number of text encoder invocations since the cache was created.
    pub fn text_encodes(&self) -> usize {
        self.text_encodes
    }

    pub fn image_encodes(&self) -> usize {
        self.image_encodes
    }

    pub fn len(&self) -> usize {
        self.text.len() + self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mask marking the first latent frame as given, `[1, temporal_stride, frames, h, w]`.
///
/// Pixel frame 0 is repeated `temporal_stride` times so the pixel-level mask
/// folds evenly into latent frames; the result is 1 on latent frame 0 and 0
/// elsewhere.
pub fn frame_mask(
    frame_count: usize,
    lat_h: usize,
    lat_w: usize,
    temporal_stride: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let mut pixel = vec![0f32; frame_count];
    if let Some(first) = pixel.first_mut() {
        *first = 1.0;
    }
    let mut expanded = vec![pixel[0]; temporal_stride - 1];
    expanded.extend_from_slice(&pixel);
    let latent_frames = expanded.len() / temporal_stride;
    if expanded.len() != latent_frames * temporal_stride {
        candle_core::bail!(
            "frame count {frame_count} does not fold into latent frames of stride {temporal_stride}"
        );
    }

    Tensor::from_vec(expanded, (1, latent_frames, temporal_stride, 1, 1), device)?
        .transpose(1, 2)?
        .broadcast_as((1, temporal_stride, latent_frames, lat_h, lat_w))?
        .contiguous()
}

pub struct ConditioningAssembler<'a> {
    text_encoder: Box<dyn EncodesText + 'a>,
    image_encoder: Option<Box<dyn EncodesImage + 'a>>,
    cache: EncoderCache,
    config: WanConfig,
    device: Device,
    dtype: DType,
}

impl<'a> ConditioningAssembler<'a> {
    pub fn new(
        text_encoder: Box<dyn EncodesText + 'a>,
        image_encoder: Option<Box<dyn EncodesImage + 'a>>,
        config: WanConfig,
        device: &Device,
        dtype: DType,
    ) -> Self {
        Self {
            text_encoder,
            image_encoder,
            cache: EncoderCache::default(),
            config,
            device: device.clone(),
            dtype,
        }
    }

    pub fn cache(&self) -> &EncoderCache {
        &self.cache
    }

    /// Drops all cached encodings; the next batch starts cold.
    pub fn reset_cache(&mut self) {
        self.cache = EncoderCache::default();
    }

    /// Fails on missing conditioning before anything is allocated.
    pub fn validate(&self, request: &ConditioningRequest) -> std::result::Result<(), ConfigError> {
        if self.config.is_i2v() {
            if request.image_path.is_none() {
                return Err(ConfigError::MissingImage {
                    task: self.config.task.to_string(),
                    prompt: request.prompt.clone(),
                });
            }
            if self.image_encoder.is_none() {
                return Err(ConfigError::MissingImageEncoder(self.config.task.to_string()));
            }
        }
        Ok(())
    }

    /// Encodes every distinct prompt and image of the batch up front.
    pub fn prepare_batch(
        &mut self,
        requests: &[(ConditioningRequest, InferenceConfig)],
        guided: impl Fn(&InferenceConfig) -> bool,
    ) -> Result<()> {
        for (request, _) in requests {
            self.validate(request)?;
        }
        for (request, inference) in requests {
            self.text_context(&request.prompt)?;
            if guided(inference) {
                self.text_context(&request.negative_prompt)?;
            }
            if self.config.is_i2v()
                && let Some(path) = &request.image_path
            {
                self.image_embedding(path, inference.width, inference.height)?;
            }
        }
        info!(
            text_encodes = self.cache.text_encodes,
            image_encodes = self.cache.image_encodes,
            "conditioning cache warmed"
        );
        Ok(())
    }

    /// Text context `[L, D]` for `prompt`, encoding it on first use.
    pub fn text_context(&mut self, prompt: &str) -> Result<Tensor> {
        if let Some(t) = self.cache.text.get(prompt) {
            return Ok(t.clone());
        }
        let encoding = self.text_encoder.encode(&[prompt.to_string()], &self.device)?;
        let context = encoding.trimmed(0)?;
        let (len, _) = context.dims2()?;
        let context = context
            .narrow(0, 0, len.min(self.config.text_len))?
            .to_device(&Device::Cpu)?;
        self.cache.text_encodes += 1;
        debug!(prompt_len = prompt.len(), tokens = len, "text encoded");
        Ok(self
            .cache
            .text
            .entry(prompt.to_string())
            .or_insert(context)
            .clone())
    }

    /// Image embedding for `path`, encoding it on first use.
    pub fn image_embedding(&mut self, path: &Path, width: usize, height: usize) -> Result<Tensor> {
        if let Entry::Occupied(e) = self.cache.images.entry(path.to_path_buf()) {
            return Ok(e.get().clone());
        }
        let Some(encoder) = self.image_encoder.as_mut() else {
            return Err(ConfigError::MissingImageEncoder(self.config.task.to_string()).into());
        };
        let image = load_conditioning_image(path, width, height)?.to_device(&self.device)?;
        let embedding = encoder.encode_image(&image, &self.device)?.to_device(&Device::Cpu)?;
        self.cache.image_encodes += 1;
        debug!(path = %path.display(), "image encoded");
        Ok(self
            .cache
            .images
            .entry(path.to_path_buf())
            .or_insert(embedding)
            .clone())
    }

    fn place(&self, t: &Tensor) -> candle_core::Result<Tensor> {
        t.to_device(&self.device)?.to_dtype(self.dtype)
    }

    /// Builds the conditioning bundle for one sample.
    ///
    /// For I2V the autoencoder is acquired through `placement` for the image
    /// encode only and is back on the host when this returns.
    pub fn build(
        &mut self,
        request: &ConditioningRequest,
        inference: &InferenceConfig,
        shape: &LatentShape,
        guided: bool,
        placement: &DevicePlacement,
        vae: &mut dyn EncodesDecodes,
    ) -> Result<ConditioningBundle> {
        self.validate(request)?;

        let context = self.text_context(&request.prompt)?;
        let context_null = if guided {
            Some(self.text_context(&request.negative_prompt)?)
        } else {
            None
        };

        let mut bundle = ConditioningBundle {
            context: self.place(&context)?,
            context_null: context_null.map(|c| self.place(&c)).transpose()?,
            seq_len: shape.seq_len(self.config.patch_size),
            clip_fea: None,
            y: None,
        };

        if let (true, Some(path)) = (self.config.is_i2v(), request.image_path.as_deref()) {
            let clip = self.image_embedding(path, inference.width, inference.height)?;
            bundle.clip_fea = Some(self.place(&clip)?);
            bundle.y = Some(self.image_latent(path, inference, shape, placement, vae)?);
        }

        Ok(bundle)
    }

    /// `y = mask ‖ vae.encode(image padded with zero frames)`, `[1, 20, T, h, w]`.
    fn image_latent(
        &self,
        path: &Path,
        inference: &InferenceConfig,
        shape: &LatentShape,
        placement: &DevicePlacement,
        vae: &mut dyn EncodesDecodes,
    ) -> Result<Tensor> {
        let (stride_t, _, _) = self.config.vae_stride;
        let image = load_conditioning_image(path, inference.width, inference.height)?;
        let video = if inference.frame_count > 1 {
            let (c, _, h, w) = image.dims4()?;
            let pad = Tensor::zeros((c, inference.frame_count - 1, h, w), DType::F32, &Device::Cpu)?;
            Tensor::cat(&[&image, &pad], 1)?
        } else {
            image
        };

        let encoded = {
            let mut vae = placement.acquire(vae)?;
            let video = video.to_device(placement.compute_device())?;
            vae.encode(&video)?
        };
        let encoded = encoded.narrow(1, 0, shape.frames)?.unsqueeze(0)?;

        let mask = frame_mask(
            inference.frame_count,
            shape.height,
            shape.width,
            stride_t,
            &self.device,
        )?;
        let y = Tensor::cat(&[&mask, &encoded.to_device(&self.device)?.to_dtype(DType::F32)?], 1)?;
        Ok(self.place(&y)?)
    }
}

//! Lightweight deterministic collaborators for running the pipeline without
//! model weights (`--mock` in the CLI, and the integration tests).
//!
//! Every mock writes to a shared [`EventLog`] so callers can check call counts
//! and ordering after the pipeline has taken ownership of the components.

use crate::config::PipelineConfig;
use crate::models::wan::components::{
    EncodesDecodes, EncodesImage, EncodesText, Offload, Predicts, Residency, TextEncoding,
};
use crate::models::wan::configs::WanConfig;
use crate::models::wan::packager::ModelInput;
use crate::models::wan::pipeline::{StopSignal, WanPipeline};
use crate::models::wan::placement::DevicePlacement;
use crate::utils::deterministic_rng::Pcg32;
use candle_core::{DType, Device, Result, Tensor};
use std::sync::{Arc, Mutex};

pub const TRANSFORMER_FORWARD: &str = "transformer.forward";
pub const TEXT_ENCODE: &str = "text.encode";
pub const IMAGE_ENCODE: &str = "image.encode";
pub const VAE_ENCODE: &str = "vae.encode";
pub const VAE_DECODE: &str = "vae.decode";
pub const VAE_TO_COMPUTE: &str = "vae.place:compute";
pub const VAE_TO_HOST: &str = "vae.place:host";

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        if let Ok(mut events) = self.0.lock() {
            events.push(event.into());
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events equal to `name` or starting with `name:`.
    pub fn count(&self, name: &str) -> usize {
        let prefix = format!("{name}:");
        self.events()
            .iter()
            .filter(|e| *e == name || e.starts_with(&prefix))
            .count()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.0.lock() {
            events.clear();
        }
    }

    /// Residency implied by the last placement event, `Host` if never placed.
    pub fn vae_residency(&self) -> Residency {
        self.events()
            .iter()
            .rev()
            .find_map(|e| match e.as_str() {
                VAE_TO_COMPUTE => Some(Residency::Compute),
                VAE_TO_HOST => Some(Residency::Host),
                _ => None,
            })
            .unwrap_or(Residency::Host)
    }
}

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Predicts `0.5 * x + mean(context)`, plus a share of the image latent for I2V.
pub struct MockTransformer {
    device: Device,
    dtype: DType,
    i2v: bool,
    log: EventLog,
    calls: usize,
    fail_at: Option<usize>,
    nan_at: Option<usize>,
    stop_after: Option<(usize, StopSignal)>,
}

impl MockTransformer {
    pub fn new(config: &WanConfig, device: &Device, log: EventLog) -> Self {
        Self {
            device: device.clone(),
            dtype: DType::F32,
            i2v: config.is_i2v(),
            log,
            calls: 0,
            fail_at: None,
            nan_at: None,
            stop_after: None,
        }
    }

    /// Fails the `call`-th forward (0-based).
    pub fn failing_at(mut self, call: usize) -> Self {
        self.fail_at = Some(call);
        self
    }

    /// Returns NaN on the `call`-th forward (0-based).
    pub fn nan_at(mut self, call: usize) -> Self {
        self.nan_at = Some(call);
        self
    }

    /// Raises `signal` right after forward number `calls` completes.
    pub fn stopping_after(mut self, calls: usize, signal: StopSignal) -> Self {
        self.stop_after = Some((calls, signal));
        self
    }
}

impl Predicts for MockTransformer {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&mut self, input: &ModelInput) -> Result<Vec<Tensor>> {
        let call = self.calls;
        self.calls += 1;
        self.log.push(TRANSFORMER_FORWARD);

        if self.fail_at == Some(call) {
            candle_core::bail!("mock transformer failure at call {call}");
        }
        if self.i2v && (input.y.is_none() || input.clip_fea.is_none()) {
            candle_core::bail!("image-to-video forward without image conditioning");
        }

        let mut preds = Vec::with_capacity(input.latents.len());
        for (i, latent) in input.latents.iter().enumerate() {
            if latent.dims().len() != 4 {
                candle_core::bail!("expected a [C, T, h, w] latent, got {:?}", latent.dims());
            }
            let Some(context) = input.context.get(i).or(input.context.first()) else {
                candle_core::bail!("forward without text context");
            };
            let bias = context.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()? as f64;
            let mut pred = latent.to_dtype(DType::F32)?.affine(0.5, bias * 0.1)?;
            if let Some(y) = input.y.as_ref().and_then(|y| y.get(i)) {
                let (c, ..) = pred.dims4()?;
                let image = y.narrow(0, y.dim(0)? - c, c)?.to_dtype(DType::F32)?;
                pred = pred.add(&image.affine(0.05, 0.0)?)?;
            }
            if self.nan_at == Some(call) {
                pred = pred.affine(f64::NAN, 0.0)?;
            }
            preds.push(pred.to_dtype(latent.dtype())?);
        }

        if let Some((after, signal)) = &self.stop_after
            && self.calls == *after
        {
            signal.stop();
        }
        Ok(preds)
    }
}

/// Hash-seeded embeddings; one token per whitespace-separated word.
pub struct MockTextEncoder {
    hidden: usize,
    max_len: usize,
    log: EventLog,
}

impl MockTextEncoder {
    pub fn new(hidden: usize, max_len: usize, log: EventLog) -> Self {
        Self {
            hidden,
            max_len,
            log,
        }
    }
}

impl EncodesText for MockTextEncoder {
    fn encode(&mut self, prompts: &[String], device: &Device) -> Result<TextEncoding> {
        let mut embeds = Vec::with_capacity(prompts.len());
        let mut mask = Vec::with_capacity(prompts.len() * self.max_len);
        for prompt in prompts {
            self.log.push(format!("{TEXT_ENCODE}:{prompt}"));
            let mut rng = Pcg32::seeded(fnv1a(prompt));
            embeds.push(rng.randn((self.max_len, self.hidden), device)?);
            let tokens = prompt.split_whitespace().count().min(self.max_len);
            mask.extend((0..self.max_len).map(|i| u8::from(i < tokens)));
        }
        Ok(TextEncoding {
            embeds: Tensor::stack(&embeds, 0)?,
            mask: Tensor::from_vec(mask, (prompts.len(), self.max_len), device)?,
        })
    }
}

/// Returns `[1, tokens, hidden]` filled with the image mean.
pub struct MockImageEncoder {
    hidden: usize,
    tokens: usize,
    log: EventLog,
}

impl MockImageEncoder {
    pub fn new(hidden: usize, tokens: usize, log: EventLog) -> Self {
        Self {
            hidden,
            tokens,
            log,
        }
    }
}

impl EncodesImage for MockImageEncoder {
    fn encode_image(&mut self, image: &Tensor, device: &Device) -> Result<Tensor> {
        self.log.push(IMAGE_ENCODE);
        let mean = image.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()? as f64;
        Tensor::ones((1, self.tokens, self.hidden), DType::F32, device)?.affine(mean, 0.0)
    }
}

/// Pooling encoder and nearest-neighbour decoder with the Wan strides.
pub struct MockAutoencoder {
    residency: Residency,
    latent_channels: usize,
    stride: (usize, usize, usize),
    log: EventLog,
    fail_place: bool,
    fail_decode: bool,
}

impl MockAutoencoder {
    pub fn new(config: &WanConfig, log: EventLog) -> Self {
        Self {
            residency: Residency::Host,
            latent_channels: config.latent_channels,
            stride: config.vae_stride,
            log,
            fail_place: false,
            fail_decode: false,
        }
    }

    pub fn failing_placement(mut self) -> Self {
        self.fail_place = true;
        self
    }

    pub fn failing_decode(mut self) -> Self {
        self.fail_decode = true;
        self
    }

    fn require_compute(&self, op: &str) -> Result<()> {
        if self.residency != Residency::Compute {
            candle_core::bail!("autoencoder {op} called while on the host");
        }
        Ok(())
    }
}

impl Offload for MockAutoencoder {
    fn component_name(&self) -> &str {
        "vae"
    }

    fn residency(&self) -> Residency {
        self.residency
    }

    fn place(&mut self, residency: Residency, _device: &Device) -> Result<()> {
        if self.fail_place && residency == Residency::Compute {
            candle_core::bail!("mock autoencoder does not fit on the device");
        }
        self.residency = residency;
        self.log.push(match residency {
            Residency::Compute => VAE_TO_COMPUTE,
            Residency::Host => VAE_TO_HOST,
        });
        Ok(())
    }
}

impl EncodesDecodes for MockAutoencoder {
    fn encode(&mut self, video: &Tensor) -> Result<Tensor> {
        self.require_compute("encode")?;
        self.log.push(VAE_ENCODE);
        let (st, sh, _) = self.stride;
        let (_, frames, _, _) = video.dims4()?;
        let latent_frames = (frames - 1) / st + 1;
        let ids: Vec<u32> = (0..latent_frames).map(|t| (t * st) as u32).collect();
        let ids = Tensor::from_vec(ids, latent_frames, video.device())?;

        let pooled = video
            .to_dtype(DType::F32)?
            .permute((1, 0, 2, 3))?
            .contiguous()?
            .avg_pool2d(sh)?
            .index_select(&ids, 0)?
            .mean_keepdim(1)?;
        let (t, _, h, w) = pooled.dims4()?;
        pooled
            .broadcast_as((t, self.latent_channels, h, w))?
            .permute((1, 0, 2, 3))?
            .contiguous()
    }

    fn decode(&mut self, latents: &Tensor) -> Result<Tensor> {
        self.require_compute("decode")?;
        self.log.push(VAE_DECODE);
        if self.fail_decode {
            candle_core::bail!("mock decode failure");
        }
        let (st, sh, sw) = self.stride;
        let (b, _, t, h, w) = latents.dims5()?;
        let frames = (t - 1) * st + 1;
        let ids: Vec<u32> = (0..frames)
            .map(|f| if f == 0 { 0 } else { ((f - 1) / st + 1) as u32 })
            .collect();
        let ids = Tensor::from_vec(ids, frames, latents.device())?;

        latents
            .narrow(1, 0, 3)?
            .to_dtype(DType::F32)?
            .tanh()?
            .index_select(&ids, 2)?
            .reshape((b, 3 * frames, h, w))?
            .upsample_nearest2d(h * sh, w * sw)?
            .reshape((b, 3, frames, h * sh, w * sw))
    }
}

/// Text embedding width used by the mock encoders.
pub const MOCK_HIDDEN: usize = 8;
/// Text tokens produced by the mock text encoder.
pub const MOCK_TEXT_LEN: usize = 16;

/// A pipeline wired to mock components sharing `log`.
pub fn mock_pipeline(
    config: WanConfig,
    pipeline_config: PipelineConfig,
    device: &Device,
    log: &EventLog,
) -> WanPipeline<'static> {
    let transformer = MockTransformer::new(&config, device, log.clone());
    mock_pipeline_with(config, pipeline_config, device, log, transformer, |vae| vae)
}

/// Like [`mock_pipeline`] with a customised transformer and autoencoder.
pub fn mock_pipeline_with(
    config: WanConfig,
    pipeline_config: PipelineConfig,
    device: &Device,
    log: &EventLog,
    transformer: MockTransformer,
    vae: impl FnOnce(MockAutoencoder) -> MockAutoencoder,
) -> WanPipeline<'static> {
    let text = MockTextEncoder::new(MOCK_HIDDEN, MOCK_TEXT_LEN, log.clone());
    let image: Option<Box<dyn EncodesImage>> = if config.is_i2v() {
        Some(Box::new(MockImageEncoder::new(MOCK_HIDDEN, 4, log.clone())))
    } else {
        None
    };
    let vae = vae(MockAutoencoder::new(&config, log.clone()));
    let placement = DevicePlacement::new(device.clone()).with_reclaim_hook(|_| Ok(()));
    WanPipeline::new(
        config,
        pipeline_config,
        Box::new(transformer),
        Box::new(text),
        image,
        Box::new(vae),
        placement,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::wan::configs::presets;

    #[test]
    fn autoencoder_shapes_follow_strides() -> Result<()> {
        let cfg = presets::t2v_1_3b();
        let mut vae = MockAutoencoder::new(&cfg, EventLog::new());
        vae.place(Residency::Compute, &Device::Cpu)?;
        let video = Tensor::zeros((3, 9, 32, 48), DType::F32, &Device::Cpu)?;
        let latent = vae.encode(&video)?;
        assert_eq!(latent.dims(), &[16, 3, 4, 6]);
        let decoded = vae.decode(&latent.unsqueeze(0)?)?;
        assert_eq!(decoded.dims(), &[1, 3, 9, 32, 48]);
        Ok(())
    }

    #[test]
    fn autoencoder_refuses_host_use() -> Result<()> {
        let cfg = presets::t2v_1_3b();
        let mut vae = MockAutoencoder::new(&cfg, EventLog::new());
        let latent = Tensor::zeros((1, 16, 1, 2, 2), DType::F32, &Device::Cpu)?;
        assert!(vae.decode(&latent).is_err());
        Ok(())
    }

    #[test]
    fn text_encoder_masks_by_word_count() -> Result<()> {
        let log = EventLog::new();
        let mut enc = MockTextEncoder::new(4, 6, log.clone());
        let out = enc.encode(&["a red ball".to_string()], &Device::Cpu)?;
        assert_eq!(out.embeds.dims(), &[1, 6, 4]);
        assert_eq!(out.trimmed(0)?.dims(), &[3, 4]);
        assert_eq!(log.count(TEXT_ENCODE), 1);
        Ok(())
    }
}

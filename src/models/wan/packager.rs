//! Builds the keyword inputs of a transformer forward call, for sampling and for
//! training, and the flow-matching regression target.

use crate::models::wan::conditioning::ConditioningBundle;
use candle_core::{DType, Device, Result, Tensor, Var};

/// One transformer forward call's inputs.
#[derive(Debug, Clone)]
pub struct ModelInput {
    /// One `[C, T, h, w]` latent per sample
    pub latents: Vec<Tensor>,
    /// `[B]`
    pub timestep: Tensor,
    /// One `[L, D]` text context per sample
    pub context: Vec<Tensor>,
    pub seq_len: usize,
    pub clip_fea: Option<Tensor>,
    /// Per-sample `[4 + 16, T, h, w]` mask and image latent (I2V)
    pub y: Option<Vec<Tensor>>,
}

impl ModelInput {
    pub fn batch_size(&self) -> usize {
        self.latents.len()
    }
}

/// Which text context a guided forward pass uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Positive,
    Negative,
}

/// A cached training batch.
#[derive(Debug, Clone)]
pub struct TrainingBatch {
    /// `[B, 16, T, h, w]`
    pub latents: Tensor,
    /// One `[L, D]` context per sample
    pub context: Vec<Tensor>,
    /// `[B, 20, T, h, w]` for I2V
    pub image_latents: Option<Tensor>,
    pub clip_fea: Option<Tensor>,
}

/// Packaged training forward plus the loss target.
#[derive(Debug)]
pub struct TrainingPackage {
    pub input: ModelInput,
    /// `noise - latents`
    pub target: Tensor,
    /// Gradient-tracked leaves when gradient checkpointing is on
    pub tracked: Vec<Var>,
}

#[derive(Debug, Clone)]
pub struct InputPackager {
    device: Device,
    dtype: DType,
    patch_size: (usize, usize, usize),
}

impl InputPackager {
    pub fn new(device: &Device, dtype: DType, patch_size: (usize, usize, usize)) -> Self {
        Self {
            device: device.clone(),
            dtype,
            patch_size,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn place(&self, t: &Tensor) -> Result<Tensor> {
        t.to_device(&self.device)?.to_dtype(self.dtype)
    }

    /// Inputs for one guided or unguided pass over `latent` (`[1, C, T, h, w]`).
    pub fn pack_for_inference(
        &self,
        bundle: &ConditioningBundle,
        branch: Branch,
        latent: &Tensor,
        timestep: i64,
    ) -> Result<ModelInput> {
        let context = match branch {
            Branch::Positive => &bundle.context,
            Branch::Negative => bundle.context_null.as_ref().ok_or_else(|| {
                candle_core::Error::Msg("negative pass requested without a negative context".into())
            })?,
        };
        let latents = latent
            .to_device(&self.device)?
            .to_dtype(self.dtype)?
            .chunk(latent.dim(0)?, 0)?
            .into_iter()
            .map(|t| t.squeeze(0))
            .collect::<Result<Vec<_>>>()?;
        let timestep = Tensor::new(&[timestep as f32], &self.device)?;

        Ok(ModelInput {
            latents,
            timestep,
            context: vec![self.place(context)?],
            seq_len: bundle.seq_len,
            clip_fea: bundle.clip_fea.as_ref().map(|t| self.place(t)).transpose()?,
            y: bundle
                .y
                .as_ref()
                .map(|y| Ok::<_, candle_core::Error>(vec![self.place(&y.squeeze(0)?)?]))
                .transpose()?,
        })
    }

    /// Training forward inputs for `noisy` (`[B, 16, T, h, w]`) and the target
    /// `noise - batch.latents`.
    pub fn pack_for_training(
        &self,
        batch: &TrainingBatch,
        noise: &Tensor,
        noisy: &Tensor,
        timesteps: &Tensor,
        gradient_checkpointing: bool,
    ) -> Result<TrainingPackage> {
        let (_, _, frames, height, width) = noisy.dims5()?;
        let (pt, ph, pw) = self.patch_size;
        let seq_len = frames * height * width / (pt * ph * pw);

        let mut tracked = Vec::new();
        let mut track = |t: Tensor| -> Result<Tensor> {
            if gradient_checkpointing {
                let v = Var::from_tensor(&t)?;
                let out = v.as_tensor().clone();
                tracked.push(v);
                Ok(out)
            } else {
                Ok(t)
            }
        };

        let noisy = track(self.place(noisy)?)?;
        let context = batch
            .context
            .iter()
            .map(|c| track(self.place(c)?))
            .collect::<Result<Vec<_>>>()?;
        let y = match &batch.image_latents {
            Some(il) => {
                let il = track(self.place(il)?)?;
                Some(split_batch(&il)?)
            }
            None => None,
        };
        let clip_fea = match &batch.clip_fea {
            Some(c) => Some(track(self.place(c)?)?),
            None => None,
        };

        let latents = batch.latents.to_device(&self.device)?.to_dtype(noise.dtype())?;
        let target = noise.to_device(&self.device)?.sub(&latents)?;

        let input = ModelInput {
            latents: split_batch(&noisy)?,
            timestep: timesteps.to_device(&self.device)?.to_dtype(DType::F32)?,
            context,
            seq_len,
            clip_fea,
            y,
        };
        Ok(TrainingPackage {
            input,
            target,
            tracked,
        })
    }
}

fn split_batch(t: &Tensor) -> Result<Vec<Tensor>> {
    t.chunk(t.dim(0)?, 0)?
        .into_iter()
        .map(|c| c.squeeze(0))
        .collect()
}

/// Stacks per-sample predictions back into a batch tensor.
pub fn stack_predictions(preds: &[Tensor]) -> Result<Tensor> {
    if preds.is_empty() {
        candle_core::bail!("transformer returned no predictions");
    }
    Tensor::stack(preds, 0)
}

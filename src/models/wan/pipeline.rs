//! Wan sampling pipeline: conditioning, noise init, guided UniPC denoising, decode.

use crate::config::{ConfigError, InferenceConfig, OutputType, PipelineConfig};
use crate::models::wan::components::{EncodesDecodes, EncodesImage, EncodesText, Predicts};
use crate::models::wan::conditioning::{
    ConditioningAssembler, ConditioningBundle, ConditioningError, ConditioningRequest,
    EncoderCache,
};
use crate::models::wan::configs::WanConfig;
use crate::models::wan::latents::{LatentBuffer, LatentShape};
use crate::models::wan::packager::{Branch, InputPackager};
use crate::models::wan::placement::{DevicePlacement, PlacementError};
use crate::models::wan::scheduler::{FlowUniPcScheduler, SchedulerError};
use crate::utils::deterministic_rng::Pcg32;
use candle_core::{DType, Device, Tensor};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Conditioning(#[from] ConditioningError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error("non-finite noise prediction at step {step} (timestep {timestep})")]
    NonFinite { step: usize, timestep: i64 },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, SamplingError>;

/// Classifier-free guidance, fixed for the whole sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Guidance {
    Disabled,
    Classifier { scale: f64 },
}

impl Guidance {
    /// A scale of exactly 1.0 is the unguided prediction and skips the negative pass.
    pub fn from_scale(scale: f64) -> Self {
        if scale == 1.0 {
            Self::Disabled
        } else {
            Self::Classifier { scale }
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Classifier { .. })
    }

    /// Transformer forward calls per denoising step.
    pub fn passes_per_step(&self) -> usize {
        match self {
            Self::Disabled => 1,
            Self::Classifier { .. } => 2,
        }
    }

    /// `uncond + scale * (cond - uncond)`
    pub fn combine(&self, cond: &Tensor, uncond: Option<&Tensor>) -> candle_core::Result<Tensor> {
        match (self, uncond) {
            (Self::Disabled, _) => Ok(cond.clone()),
            (Self::Classifier { scale }, Some(uncond)) => {
                uncond.add(&cond.sub(uncond)?.affine(*scale, 0.0)?)
            }
            (Self::Classifier { .. }, None) => {
                candle_core::bail!("classifier-free guidance needs an unconditional prediction")
            }
        }
    }
}

/// External stop request, checked between denoising steps.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
    current_step: Arc<AtomicUsize>,
    total_steps: Arc<AtomicUsize>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Clears a previous stop request.
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Steps finished in the current sample.
    pub fn current_step(&self) -> usize {
        self.current_step.load(Ordering::SeqCst)
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps.load(Ordering::SeqCst)
    }

    fn begin(&self, total: usize) {
        self.current_step.store(0, Ordering::SeqCst);
        self.total_steps.store(total, Ordering::SeqCst);
    }

    fn advance(&self, done: usize) {
        self.current_step.store(done, Ordering::SeqCst);
    }
}

/// Where a sample is in `Init -> Step* -> Decode -> Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplePhase {
    Idle,
    Init,
    Step(usize),
    Decode,
    Done,
}

#[derive(Debug)]
pub enum SampleOutcome {
    /// Video `[1, 3, F, H, W]` in `[0, 1]` on the host, or the final latent
    /// when the pipeline is configured for `OutputType::Latent`.
    Completed(Tensor),
    /// Stop was requested; nothing was decoded.
    Stopped { completed_steps: usize },
}

impl SampleOutcome {
    pub fn into_tensor(self) -> Option<Tensor> {
        match self {
            Self::Completed(t) => Some(t),
            Self::Stopped { .. } => None,
        }
    }
}

/// One sample of a batch: what to condition on and how to sample it.
#[derive(Debug, Clone)]
pub struct SampleJob {
    pub request: ConditioningRequest,
    pub inference: InferenceConfig,
}

pub struct WanPipeline<'a> {
    config: WanConfig,
    pipeline_config: PipelineConfig,
    transformer: Box<dyn Predicts + 'a>,
    vae: Box<dyn EncodesDecodes + 'a>,
    assembler: ConditioningAssembler<'a>,
    placement: DevicePlacement,
    packager: InputPackager,
    stop: StopSignal,
    phase: SamplePhase,
}

impl<'a> WanPipeline<'a> {
    pub fn new(
        config: WanConfig,
        pipeline_config: PipelineConfig,
        transformer: Box<dyn Predicts + 'a>,
        text_encoder: Box<dyn EncodesText + 'a>,
        image_encoder: Option<Box<dyn EncodesImage + 'a>>,
        vae: Box<dyn EncodesDecodes + 'a>,
        placement: DevicePlacement,
    ) -> Self {
        let device = placement.compute_device().clone();
        let dtype = transformer.dtype();
        let packager = InputPackager::new(&device, dtype, config.patch_size);
        let assembler =
            ConditioningAssembler::new(text_encoder, image_encoder, config.clone(), &device, dtype);
        Self {
            config,
            pipeline_config,
            transformer,
            vae,
            assembler,
            placement,
            packager,
            stop: StopSignal::new(),
            phase: SamplePhase::Idle,
        }
    }

    pub fn config(&self) -> &WanConfig {
        &self.config
    }

    pub fn pipeline_config(&self) -> &PipelineConfig {
        &self.pipeline_config
    }

    /// Handle for stopping the pipeline from another thread.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Uses an existing stop handle, e.g. one shared with a UI.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn phase(&self) -> SamplePhase {
        self.phase
    }

    pub fn placement(&self) -> &DevicePlacement {
        &self.placement
    }

    pub fn conditioning_cache(&self) -> &EncoderCache {
        self.assembler.cache()
    }

    fn device(&self) -> Device {
        self.placement.compute_device().clone()
    }

    fn check_job(&self, job: &SampleJob) -> std::result::Result<(), ConfigError> {
        job.inference.validate()?;
        self.assembler.validate(&job.request)?;
        LatentShape::for_inference(&job.inference, &self.config)?;
        Ok(())
    }

    /// Samples every job in order with one shared conditioning cache.
    ///
    /// Every job is validated before anything is encoded or allocated. The
    /// batch stops at the first failed sample.
    pub fn sample_batch(&mut self, jobs: &[SampleJob]) -> Result<Vec<SampleOutcome>> {
        for job in jobs {
            self.check_job(job)?;
        }

        self.assembler.reset_cache();
        let pairs: Vec<_> = jobs
            .iter()
            .map(|j| (j.request.clone(), j.inference.clone()))
            .collect();
        self.assembler
            .prepare_batch(&pairs, |inf| Guidance::from_scale(inf.guidance_scale).is_enabled())?;

        let mut outcomes = Vec::with_capacity(jobs.len());
        for (i, job) in jobs.iter().enumerate() {
            info!(index = i, total = jobs.len(), "sample");
            let outcome = self.run_sample(job)?;
            let stopped = matches!(outcome, SampleOutcome::Stopped { .. });
            outcomes.push(outcome);
            if stopped {
                break;
            }
        }
        Ok(outcomes)
    }

    /// Runs one sample through `Init -> Step* -> Decode`.
    ///
    /// A standalone sample is its own batch: the conditioning cache is
    /// cleared first and only holds this job's encodings afterwards.
    pub fn sample(&mut self, job: &SampleJob) -> Result<SampleOutcome> {
        self.check_job(job)?;
        self.assembler.reset_cache();
        self.run_sample(job)
    }

    fn run_sample(&mut self, job: &SampleJob) -> Result<SampleOutcome> {
        let inference = &job.inference;
        let guidance = Guidance::from_scale(inference.guidance_scale);
        let shape = LatentShape::for_inference(inference, &self.config)?;
        let device = self.device();
        let dtype = self.transformer.dtype();

        self.phase = SamplePhase::Init;
        info!(
            frames = inference.frame_count,
            height = inference.height,
            width = inference.width,
            steps = inference.num_inference_steps,
            guidance = ?guidance,
            seed = inference.seed,
            "Wan sample start"
        );

        let mut rng = Pcg32::seeded(inference.seed);
        let mut latents = LatentBuffer::init_noise(
            shape,
            &mut rng,
            self.pipeline_config.noise_layout,
            self.pipeline_config.latent_placement,
            &device,
        )?;

        let bundle = self.assembler.build(
            &job.request,
            inference,
            &shape,
            guidance.is_enabled(),
            &self.placement,
            self.vae.as_mut(),
        )?;
        debug!(seq_len = bundle.seq_len, i2v = bundle.y.is_some(), "conditioning ready");

        let mut scheduler = FlowUniPcScheduler::new(self.pipeline_config.scheduler.clone())?;
        let timesteps = scheduler
            .set_timesteps(
                inference.num_inference_steps,
                &device,
                Some(inference.discrete_flow_shift),
            )?
            .to_vec();

        self.stop.begin(timesteps.len());
        let start = Instant::now();
        for (i, &t) in timesteps.iter().enumerate() {
            if self.stop.is_stopped() {
                info!(completed_steps = i, "sampling stopped");
                self.phase = SamplePhase::Done;
                return Ok(SampleOutcome::Stopped { completed_steps: i });
            }
            self.phase = SamplePhase::Step(i);

            let x = latents.for_forward(dtype)?;
            let out_device = latents.current().device().clone();
            let cond = self.predict(&bundle, Branch::Positive, &x, t, &out_device)?;
            let uncond = if guidance.is_enabled() {
                Some(self.predict(&bundle, Branch::Negative, &x, t, &out_device)?)
            } else {
                None
            };
            let pred = guidance.combine(&cond, uncond.as_ref())?;

            if !all_finite(&pred)? {
                return Err(SamplingError::NonFinite { step: i, timestep: t });
            }

            let next = scheduler.step(&pred, t, latents.current())?;
            latents.replace(next)?;
            self.stop.advance(i + 1);
            debug!(step = i, timestep = t, "denoising step");
        }
        info!(
            elapsed_secs = start.elapsed().as_secs_f32(),
            "denoising complete"
        );

        self.phase = SamplePhase::Decode;
        let latent = latents.into_inner();
        let output = match self.pipeline_config.output_type {
            OutputType::Latent => latent,
            OutputType::Video => self.decode(&latent)?,
        };
        self.phase = SamplePhase::Done;
        Ok(SampleOutcome::Completed(output))
    }

    /// One transformer pass, returned as `[1, C, T, h, w]` f32 on `out_device`.
    fn predict(
        &mut self,
        bundle: &ConditioningBundle,
        branch: Branch,
        latent: &Tensor,
        timestep: i64,
        out_device: &Device,
    ) -> Result<Tensor> {
        let input = self
            .packager
            .pack_for_inference(bundle, branch, latent, timestep)?;
        let preds = self.transformer.forward(&input)?;
        let pred = preds.into_iter().next().ok_or_else(|| {
            candle_core::Error::Msg("transformer returned no predictions".to_string())
        })?;
        Ok(pred
            .unsqueeze(0)?
            .to_device(out_device)?
            .to_dtype(DType::F32)?)
    }

    /// Decodes under the placement guard and maps `[-1, 1]` to `[0, 1]`.
    fn decode(&mut self, latent: &Tensor) -> Result<Tensor> {
        let video = {
            let mut vae = self.placement.acquire(self.vae.as_mut())?;
            let latent = latent.to_device(self.placement.compute_device())?;
            vae.decode(&latent)?
        };
        Ok(postprocess_video(&video)?)
    }
}

/// True when no element is NaN or infinite.
///
/// `x - x` is zero for every finite element, so the reduction cannot overflow.
pub fn all_finite(t: &Tensor) -> candle_core::Result<bool> {
    let t = t.to_dtype(DType::F32)?;
    let residue = t.sub(&t)?.sum_all()?.to_scalar::<f32>()?;
    Ok(residue == 0.0)
}

/// `[-1, 1]` to `[0, 1]`, clamped, on the host in `f32`.
pub fn postprocess_video(video: &Tensor) -> candle_core::Result<Tensor> {
    video
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(0.5, 0.5)?
        .clamp(0f32, 1f32)
}

//! Configuration structures for the Wan sampling pipeline

use serde::{Deserialize, Serialize};

/// Temporal compression of the Wan autoencoder.
pub const VAE_TEMPORAL_STRIDE: usize = 4;
/// Pixel sizes must divide evenly into latent patches (8x spatial VAE stride, 2x2 patches).
pub const SPATIAL_MULTIPLE: usize = 16;

/// UniPC solver variant used for the B(h) coefficient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SolverType {
    Bh1,
    #[default]
    Bh2,
}

/// Flow-matching UniPC multistep scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of training timesteps (1000 for Wan)
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
    /// Shift applied once when the training sigma table is built.
    /// Distinct from the per-call discrete flow shift given to `set_timesteps`.
    #[serde(default = "default_shift")]
    pub shift: f64,
    /// Multistep order (2 is the recommended setting for guided sampling)
    #[serde(default = "default_solver_order")]
    pub solver_order: usize,
    #[serde(default)]
    pub solver_type: SolverType,
    /// Fall back to lower orders on the final steps
    #[serde(default = "default_true")]
    pub lower_order_final: bool,
    /// Step indices on which the UniC corrector is skipped
    #[serde(default)]
    pub disable_corrector: Vec<usize>,
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_shift() -> f64 {
    1.0
}

fn default_solver_order() -> usize {
    2
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            shift: 1.0,
            solver_order: 2,
            solver_type: SolverType::Bh2,
            lower_order_final: true,
            disable_corrector: Vec::new(),
        }
    }
}

/// Where the evolving latent lives between forward calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LatentPlacement {
    /// Host-resident, copied to the compute device for each forward call
    #[default]
    Lazy,
    /// Resident on the compute device for the whole loop
    Eager,
}

/// How the initial noise is drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoiseLayout {
    /// One independent draw per latent frame, concatenated along time
    #[default]
    PerFrame,
    /// A single draw for the whole latent video
    Batched,
}

/// What a finished sample returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    /// Decoded video in `[0, 1]`, shape `[B, 3, F, H, W]`
    #[default]
    Video,
    /// Final latent, shape `[B, 16, T, H/8, W/8]`
    Latent,
}

/// Pipeline-wide knobs shared by every sample of a batch
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub latent_placement: LatentPlacement,
    #[serde(default)]
    pub noise_layout: NoiseLayout,
    #[serde(default)]
    pub output_type: OutputType,
}

/// Per-sample inference configuration
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// Number of frames to generate (must be 4N+1)
    pub frame_count: usize,
    /// Video height (must be multiple of 16)
    pub height: usize,
    /// Video width (must be multiple of 16)
    pub width: usize,
    /// Random seed for the initial noise
    pub seed: u64,
    /// Number of inference steps
    pub num_inference_steps: usize,
    /// Classifier-free guidance scale; exactly 1.0 disables the negative pass
    pub guidance_scale: f64,
    /// Shift applied to the inference sigma schedule
    pub discrete_flow_shift: f64,
}

impl InferenceConfig {
    /// Create a new inference configuration with validation
    pub fn new(
        frame_count: usize,
        height: usize,
        width: usize,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            frame_count,
            height,
            width,
            seed,
            num_inference_steps: 20,
            guidance_scale: 5.0,
            discrete_flow_shift: 5.0,
        };
        config.validate_geometry()?;
        Ok(config)
    }

    fn validate_geometry(&self) -> Result<(), ConfigError> {
        let (frame_count, height, width) = (self.frame_count, self.height, self.width);
        if frame_count == 0 || !(frame_count - 1).is_multiple_of(VAE_TEMPORAL_STRIDE) {
            return Err(ConfigError::InvalidFrameCount(frame_count));
        }
        if height == 0
            || width == 0
            || !height.is_multiple_of(SPATIAL_MULTIPLE)
            || !width.is_multiple_of(SPATIAL_MULTIPLE)
        {
            return Err(ConfigError::InvalidDimensions { height, width });
        }
        Ok(())
    }

    /// Set number of inference steps
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.num_inference_steps = steps;
        self
    }

    /// Set guidance scale
    pub fn with_guidance_scale(mut self, scale: f64) -> Self {
        self.guidance_scale = scale;
        self
    }

    pub fn with_flow_shift(mut self, shift: f64) -> Self {
        self.discrete_flow_shift = shift;
        self
    }

    /// Checks every field; the pipeline calls this again before sampling
    /// since the fields are public.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_geometry()?;
        if self.num_inference_steps == 0 {
            return Err(ConfigError::InvalidSteps(self.num_inference_steps));
        }
        if !self.guidance_scale.is_finite() {
            return Err(ConfigError::InvalidGuidanceScale(self.guidance_scale));
        }
        if !self.discrete_flow_shift.is_finite() || self.discrete_flow_shift <= 0.0 {
            return Err(ConfigError::InvalidShift(self.discrete_flow_shift));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid frame count: {0}. Must be 4N+1 (e.g., 1, 5, 9, ..., 81)")]
    InvalidFrameCount(usize),
    #[error("Invalid dimensions: height={height}, width={width}. Must be non-zero multiples of 16")]
    InvalidDimensions { height: usize, width: usize },
    #[error("Invalid number of inference steps: {0}. Must be at least 1")]
    InvalidSteps(usize),
    #[error("Invalid guidance scale: {0}")]
    InvalidGuidanceScale(f64),
    #[error("Invalid flow shift: {0}. Must be finite and positive")]
    InvalidShift(f64),
    #[error("Invalid solver order: {0}. Supported orders are 1 to 3")]
    InvalidSolverOrder(usize),
    #[error("Unknown task: {0}")]
    UnknownTask(String),
    #[error("Unknown timestep sampling mode: {0}")]
    UnknownTimestepSampling(String),
    #[error("Task {task} requires a conditioning image but prompt {prompt:?} has none")]
    MissingImage { task: String, prompt: String },
    #[error("Task {0} requires an image encoder but none was provided")]
    MissingImageEncoder(String),
}

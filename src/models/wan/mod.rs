//! Wan2.1 video diffusion: sampling pipeline and training forward construction.

pub mod components;
pub mod conditioning;
pub mod configs;
pub mod latents;
pub mod mock;
pub mod packager;
pub mod pipeline;
pub mod placement;
pub mod prompts;
pub mod scheduler;
pub mod training;
pub mod weight_format;

pub use components::*;
pub use configs::{WanConfig, WanTask, get_config_by_task};
pub use pipeline::{Guidance, SampleJob, SampleOutcome, SamplingError, StopSignal, WanPipeline};
pub use scheduler::FlowUniPcScheduler;

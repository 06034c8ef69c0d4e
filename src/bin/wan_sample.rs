//! Wan2.1 sample generation
//!
//! Reads a prompt file, resolves each prompt into a sampling plan and, with
//! `--mock`, runs the full pipeline on mock components and writes a GIF per prompt.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin wan-sample -- \
//!     --prompts prompts.txt \
//!     --task t2v-1.3B \
//!     --output samples \
//!     --mock
//! ```

use anyhow::{Context, Result, bail};
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use rayon::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use candle_wan::{
    config::{LatentPlacement, NoiseLayout, OutputType, PipelineConfig},
    latents_bin::write_latents,
    models::wan::{
        SampleOutcome,
        configs::get_config_by_task,
        latents::LatentShape,
        mock::{EventLog, TRANSFORMER_FORWARD, mock_pipeline},
        prompts::{SampleDefaults, SamplePrompt, load_prompts},
        scheduler::FlowUniPcScheduler,
        weight_format::{list_checkpoint_keys, transformer_var_builder},
    },
    utils::image::video_to_rgb_frames,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate sample videos with a Wan2.1 pipeline")]
struct Args {
    /// Prompt file (.txt with inline `--` options, or .json)
    #[arg(long, conflicts_with = "prompt")]
    prompts: Option<PathBuf>,

    /// Single prompt, used when no prompt file is given
    #[arg(short, long)]
    prompt: Option<String>,

    /// Task preset: t2v-1.3B, t2v-14B, i2v-14B, t2i-14B
    #[arg(long, default_value = "t2v-14B")]
    task: String,

    /// Output directory for GIFs and latent dumps
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Pipeline configuration JSON (scheduler, placement, noise layout)
    #[arg(long)]
    pipeline_config: Option<PathBuf>,

    /// Transformer checkpoint to validate (.safetensors)
    #[arg(long)]
    dit: Option<PathBuf>,

    #[arg(long, default_value = "256")]
    width: usize,

    #[arg(long, default_value = "256")]
    height: usize,

    /// Frame count (snapped to 4N+1)
    #[arg(long, default_value = "1")]
    frames: usize,

    #[arg(long, default_value = "20")]
    steps: usize,

    /// Classifier-free guidance scale (1.0 disables the negative pass)
    #[arg(long, default_value = "5.0")]
    guidance_scale: f64,

    #[arg(long, default_value = "14.5")]
    flow_shift: f64,

    /// Keep the latent on the compute device for the whole loop
    #[arg(long)]
    eager_latents: bool,

    /// Draw the initial noise in one block instead of per frame
    #[arg(long)]
    batched_noise: bool,

    /// Write the final latent of each sample instead of decoding it
    #[arg(long)]
    save_latents: bool,

    /// Run on mock components (no model weights)
    #[arg(long)]
    mock: bool,

    /// Force CPU
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_wan=info".parse()?)
                .add_directive("wan_sample=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = get_config_by_task(&args.task)?;
    info!(task = %config.task, dim = config.dim, layers = config.num_layers, "Wan sampler");

    let device = if args.cpu {
        Device::Cpu
    } else {
        match Device::cuda_if_available(0) {
            Ok(device) => device,
            Err(e) => {
                warn!("CUDA not available: {}, falling back to CPU", e);
                Device::Cpu
            }
        }
    };

    let mut pipeline_config = match &args.pipeline_config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<PipelineConfig>(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };
    if args.eager_latents {
        pipeline_config.latent_placement = LatentPlacement::Eager;
    }
    if args.batched_noise {
        pipeline_config.noise_layout = NoiseLayout::Batched;
    }
    if args.save_latents {
        pipeline_config.output_type = OutputType::Latent;
    }

    let prompts = match (&args.prompts, &args.prompt) {
        (Some(path), _) => load_prompts(path)?,
        (None, Some(p)) => vec![SamplePrompt::new(p.clone())],
        (None, None) => bail!("either --prompts or --prompt is required"),
    };
    let defaults = SampleDefaults {
        width: args.width,
        height: args.height,
        frame_count: args.frames,
        sample_steps: args.steps,
        guidance_scale: args.guidance_scale,
        discrete_flow_shift: args.flow_shift,
    };
    let jobs = prompts
        .iter()
        .map(|p| p.to_job(&defaults, &config))
        .collect::<Result<Vec<_>, _>>()?;

    for (i, job) in jobs.iter().enumerate() {
        let inf = &job.inference;
        let shape = LatentShape::for_inference(inf, &config)?;
        let mut scheduler = FlowUniPcScheduler::new(pipeline_config.scheduler.clone())?;
        let timesteps = scheduler
            .set_timesteps(inf.num_inference_steps, &Device::Cpu, Some(inf.discrete_flow_shift))?
            .to_vec();
        info!(
            index = i,
            prompt = %job.request.prompt,
            latent = ?shape.dims(),
            seq_len = shape.seq_len(config.patch_size),
            first_timestep = timesteps.first().copied().unwrap_or_default(),
            last_timestep = timesteps.last().copied().unwrap_or_default(),
            "sampling plan"
        );
    }

    if let Some(dit) = &args.dit {
        let keys = list_checkpoint_keys(dit)?;
        info!(tensors = keys.len(), "checkpoint header read");
        transformer_var_builder(dit, &config, &device, DType::BF16)?;
        info!("checkpoint matches task {}", config.task);
    }

    if !args.mock {
        info!("no transformer backend bundled; rerun with --mock to exercise the pipeline");
        return Ok(());
    }

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;
    let log = EventLog::new();
    let mut pipeline = mock_pipeline(config.clone(), pipeline_config, &device, &log);
    let outcomes = pipeline.sample_batch(&jobs)?;

    for (i, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            SampleOutcome::Completed(tensor) if args.save_latents => {
                let path = args.output.join(format!("sample_{i:03}.latent"));
                write_latents(&path, &tensor)?;
                info!(path = %path.display(), dims = ?tensor.dims(), "latent written");
            }
            SampleOutcome::Completed(video) => {
                let gif = args.output.join(format!("sample_{i:03}.gif"));
                save_gif(&video, &gif, config.sample_fps)?;
                info!(path = %gif.display(), "saved");
            }
            SampleOutcome::Stopped { completed_steps } => {
                warn!(index = i, completed_steps, "sample stopped before decode");
            }
        }
    }

    info!(
        forwards = log.count(TRANSFORMER_FORWARD),
        text_encodes = pipeline.conditioning_cache().text_encodes(),
        "done"
    );
    Ok(())
}

fn save_gif(video: &Tensor, path: &Path, fps: usize) -> Result<()> {
    let video = video.squeeze(0)?;
    let (_, _, h, w) = video.dims4()?;
    let frames = video_to_rgb_frames(&video)?;

    let mut file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut encoder = gif::Encoder::new(&mut file, w as u16, h as u16, &[])?;
    encoder.set_repeat(gif::Repeat::Infinite)?;

    let delay = (100 / fps.max(1)) as u16;
    let frames: Vec<gif::Frame> = frames
        .par_iter()
        .map(|data| {
            let mut frame = gif::Frame::from_rgb_speed(w as u16, h as u16, data, 30);
            frame.delay = delay;
            frame
        })
        .collect();
    for frame in frames {
        encoder.write_frame(&frame)?;
    }
    Ok(())
}

//! Wan2.1 task presets.
//! One entry per released checkpoint family; the sampling pipeline only reads the
//! geometry (patch size, VAE strides, channel counts) and the sampling defaults.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default negative prompt shipped with the Wan checkpoints.
pub const WAN_NEGATIVE_PROMPT: &str = "色调艳丽，过曝，静态，细节模糊不清，字幕，风格，作品，画作，画面，静止，整体发灰，最差质量，低质量，JPEG压缩残留，丑陋的，残缺的，多余的手指，画得不好的手部，画得不好的脸部，畸形的，毁容的，形态畸形的肢体，手指融合，静止不动的画面，杂乱的背景，三条腿，背景人很多，倒着走";

/// Key prefix found on checkpoints exported from the reference training stack.
pub const LEGACY_CHECKPOINT_PREFIX: &str = "model.diffusion_model.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WanTask {
    #[serde(rename = "t2v-1.3B")]
    T2v1_3B,
    #[serde(rename = "t2v-14B")]
    T2v14B,
    #[serde(rename = "i2v-14B")]
    I2v14B,
    #[serde(rename = "t2i-14B")]
    T2i14B,
}

impl WanTask {
    pub const ALL: [WanTask; 4] = [Self::T2v1_3B, Self::T2v14B, Self::I2v14B, Self::T2i14B];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::T2v1_3B => "t2v-1.3B",
            Self::T2v14B => "t2v-14B",
            Self::I2v14B => "i2v-14B",
            Self::T2i14B => "t2i-14B",
        }
    }

    pub fn is_i2v(&self) -> bool {
        matches!(self, Self::I2v14B)
    }
}

impl fmt::Display for WanTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WanTask {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::UnknownTask(s.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanConfig {
    pub task: WanTask,
    pub dim: usize,
    pub ffn_dim: usize,
    pub freq_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub eps: f64,
    /// Maximum text tokens fed to the transformer
    pub text_len: usize,
    /// Transformer input channels: 16 latent, plus 4 mask and 16 image latent channels for I2V
    pub in_dim: usize,
    pub out_dim: usize,
    pub latent_channels: usize,
    /// (t, h, w)
    pub patch_size: (usize, usize, usize),
    /// (t, h, w) compression of the autoencoder
    pub vae_stride: (usize, usize, usize),
    pub sample_neg_prompt: String,
    pub sample_fps: usize,
}

impl WanConfig {
    pub fn is_i2v(&self) -> bool {
        self.task.is_i2v()
    }

    /// Product of the patch dimensions; tokens per patch for `seq_len`.
    pub fn patch_volume(&self) -> usize {
        self.patch_size.0 * self.patch_size.1 * self.patch_size.2
    }
}

/// Returns the preset for a task name such as `"t2v-14B"`.
pub fn get_config_by_task(task: &str) -> Result<WanConfig, ConfigError> {
    let task: WanTask = task.parse()?;
    Ok(presets::for_task(task))
}

pub mod presets {
    use super::*;

    fn common(task: WanTask) -> WanConfig {
        WanConfig {
            task,
            dim: 5120,
            ffn_dim: 13824,
            freq_dim: 256,
            num_heads: 40,
            num_layers: 40,
            eps: 1e-6,
            text_len: 512,
            in_dim: 16,
            out_dim: 16,
            latent_channels: 16,
            patch_size: (1, 2, 2),
            vae_stride: (4, 8, 8),
            sample_neg_prompt: WAN_NEGATIVE_PROMPT.to_string(),
            sample_fps: 16,
        }
    }

    pub fn for_task(task: WanTask) -> WanConfig {
        match task {
            WanTask::T2v1_3B => t2v_1_3b(),
            WanTask::T2v14B => t2v_14b(),
            WanTask::I2v14B => i2v_14b(),
            WanTask::T2i14B => t2i_14b(),
        }
    }

    pub fn t2v_1_3b() -> WanConfig {
        WanConfig {
            dim: 1536,
            ffn_dim: 8960,
            num_heads: 12,
            num_layers: 30,
            ..common(WanTask::T2v1_3B)
        }
    }

    pub fn t2v_14b() -> WanConfig {
        common(WanTask::T2v14B)
    }

    pub fn i2v_14b() -> WanConfig {
        WanConfig {
            in_dim: 36,
            ..common(WanTask::I2v14B)
        }
    }

    pub fn t2i_14b() -> WanConfig {
        common(WanTask::T2i14B)
    }
}

//! Sample prompt files.
//!
//! Text files hold one prompt per line with inline options, for example
//! `a red ball bouncing --w 832 --h 480 --f 81 --d 42 --s 20 --l 5.0 --n blurry`.
//! JSON files hold an array of objects with the same fields spelled out.

use crate::config::{ConfigError, InferenceConfig, SPATIAL_MULTIPLE, VAE_TEMPORAL_STRIDE};
use crate::models::wan::conditioning::ConditioningRequest;
use crate::models::wan::configs::WanConfig;
use crate::models::wan::pipeline::SampleJob;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PromptFileError {
    #[error("failed to read prompt file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse prompt file {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for option --{option} on line {line}")]
    InvalidOption {
        line: usize,
        option: String,
        value: String,
    },
}

/// One prompt and its optional per-sample overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplePrompt {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    #[serde(default)]
    pub width: Option<usize>,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub frame_count: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub sample_steps: Option<usize>,
    #[serde(default, alias = "cfg_scale")]
    pub guidance_scale: Option<f64>,
    #[serde(default)]
    pub discrete_flow_shift: Option<f64>,
}

/// Values used when a prompt leaves an option unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleDefaults {
    pub width: usize,
    pub height: usize,
    pub frame_count: usize,
    pub sample_steps: usize,
    pub guidance_scale: f64,
    pub discrete_flow_shift: f64,
}

impl Default for SampleDefaults {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            frame_count: 1,
            sample_steps: 20,
            guidance_scale: 5.0,
            discrete_flow_shift: 14.5,
        }
    }
}

fn round_down(value: usize, multiple: usize) -> usize {
    value / multiple * multiple
}

impl SamplePrompt {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Resolves overrides against `defaults`, snapping sizes to what the model accepts.
    pub fn inference_config(&self, defaults: &SampleDefaults) -> Result<InferenceConfig, ConfigError> {
        let width = round_down(self.width.unwrap_or(defaults.width), SPATIAL_MULTIPLE);
        let height = round_down(self.height.unwrap_or(defaults.height), SPATIAL_MULTIPLE);
        let frames = self.frame_count.unwrap_or(defaults.frame_count).max(1);
        let frames = round_down(frames - 1, VAE_TEMPORAL_STRIDE) + 1;
        let seed = self.seed.unwrap_or_else(|| {
            let seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default();
            info!(seed, prompt = %self.prompt, "no seed given, drew one from the clock");
            seed
        });

        let config = InferenceConfig::new(frames, height, width, seed)?
            .with_steps(self.sample_steps.unwrap_or(defaults.sample_steps))
            .with_guidance_scale(self.guidance_scale.unwrap_or(defaults.guidance_scale))
            .with_flow_shift(self.discrete_flow_shift.unwrap_or(defaults.discrete_flow_shift));
        config.validate()?;
        Ok(config)
    }

    /// Conditioning inputs; a missing negative prompt falls back to the task default.
    pub fn conditioning_request(&self, config: &WanConfig) -> ConditioningRequest {
        if !config.is_i2v() && self.image_path.is_some() {
            warn!(task = %config.task, "ignoring image path for a text-only task");
        }
        ConditioningRequest {
            prompt: self.prompt.clone(),
            negative_prompt: self
                .negative_prompt
                .clone()
                .unwrap_or_else(|| config.sample_neg_prompt.clone()),
            image_path: self.image_path.clone().filter(|_| config.is_i2v()),
        }
    }

    pub fn to_job(&self, defaults: &SampleDefaults, config: &WanConfig) -> Result<SampleJob, ConfigError> {
        Ok(SampleJob {
            request: self.conditioning_request(config),
            inference: self.inference_config(defaults)?,
        })
    }
}

fn parse_value<T: std::str::FromStr>(
    line: usize,
    option: &str,
    value: &str,
) -> Result<T, PromptFileError> {
    value.parse().map_err(|_| PromptFileError::InvalidOption {
        line,
        option: option.to_string(),
        value: value.to_string(),
    })
}

/// Parses one prompt line. Unknown options are logged and skipped.
pub fn parse_prompt_line(line: &str, line_no: usize) -> Result<SamplePrompt, PromptFileError> {
    let mut parts = line.split(" --");
    let mut prompt = SamplePrompt::new(parts.next().unwrap_or_default().trim());

    for part in parts {
        let part = part.trim();
        let (option, value) = part.split_once(' ').unwrap_or((part, ""));
        let value = value.trim();
        match option {
            "w" => prompt.width = Some(parse_value(line_no, option, value)?),
            "h" => prompt.height = Some(parse_value(line_no, option, value)?),
            "f" => prompt.frame_count = Some(parse_value(line_no, option, value)?),
            "d" => prompt.seed = Some(parse_value(line_no, option, value)?),
            "s" => prompt.sample_steps = Some(parse_value(line_no, option, value)?),
            "g" | "l" => prompt.guidance_scale = Some(parse_value(line_no, option, value)?),
            "fs" => prompt.discrete_flow_shift = Some(parse_value(line_no, option, value)?),
            "n" => prompt.negative_prompt = Some(value.to_string()),
            "i" => prompt.image_path = Some(PathBuf::from(value)),
            other => warn!(line = line_no, option = other, "unknown prompt option"),
        }
    }
    Ok(prompt)
}

/// Parses a text prompt file body; blank lines and `#` comments are skipped.
pub fn parse_prompt_text(text: &str) -> Result<Vec<SamplePrompt>, PromptFileError> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| {
            let l = l.trim();
            !l.is_empty() && !l.starts_with('#')
        })
        .map(|(i, l)| parse_prompt_line(l.trim(), i + 1))
        .collect()
}

/// Loads a `.json` or text prompt file.
pub fn load_prompts(path: impl AsRef<Path>) -> Result<Vec<SamplePrompt>, PromptFileError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| PromptFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let is_json = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&text).map_err(|source| PromptFileError::Json {
            path: path.to_path_buf(),
            source,
        })
    } else {
        parse_prompt_text(&text)
    }
}

//! Wan transformer checkpoint loading.
//!
//! Checkpoints exported from the original training stack prefix every key
//! with `model.diffusion_model.`; the prefix is stripped before the parameter
//! map is handed to the model.

use crate::models::wan::configs::{LEGACY_CHECKPOINT_PREFIX, WanConfig};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use safetensors::tensor::Metadata;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid safetensors file: {path}: {reason}")]
    InvalidSafetensors { path: String, reason: String },

    #[error("Missing required tensors: {missing:?}")]
    MissingTensors { missing: Vec<String> },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Keys every Wan transformer checkpoint carries.
pub const REQUIRED_TRANSFORMER_KEYS: &[&str] = &[
    "patch_embedding.weight",
    "text_embedding.0.weight",
    "time_embedding.0.weight",
    "head.head.weight",
];

/// Upper bound on a safetensors JSON header.
const MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

/// Key prefix carried only by image-to-video checkpoints.
pub const I2V_KEY_PREFIX: &str = "img_emb.";

/// Strips the legacy prefix from `name` when present.
pub fn strip_legacy_prefix(name: &str) -> &str {
    name.strip_prefix(LEGACY_CHECKPOINT_PREFIX).unwrap_or(name)
}

/// Renames legacy keys; keys without the prefix pass through unchanged.
pub fn remap_state_dict(tensors: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    let mut stripped = 0usize;
    let out: HashMap<String, Tensor> = tensors
        .into_iter()
        .map(|(k, v)| {
            let new = strip_legacy_prefix(&k);
            if new.len() != k.len() {
                stripped += 1;
            }
            (new.to_string(), v)
        })
        .collect();
    if stripped > 0 {
        debug!(stripped, "stripped legacy checkpoint prefix");
    }
    out
}

/// Tensor names in a safetensors file.
///
/// Only the length-prefixed JSON header is read; tensor data stays on disk.
pub fn list_checkpoint_keys(path: impl AsRef<Path>) -> Result<Vec<String>, LoaderError> {
    let path = path.as_ref();
    let file_read = |source| LoaderError::FileRead {
        path: path.display().to_string(),
        source,
    };
    let invalid = |reason: String| LoaderError::InvalidSafetensors {
        path: path.display().to_string(),
        reason,
    };

    let mut file = File::open(path).map_err(file_read)?;
    let file_len = file.metadata().map_err(file_read)?.len();
    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)
        .map_err(|e| invalid(format!("missing header length: {e}")))?;
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > file_len.saturating_sub(8) || header_len > MAX_HEADER_LEN {
        return Err(invalid(format!(
            "header length {header_len} exceeds file size {file_len}"
        )));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header).map_err(file_read)?;
    let metadata: Metadata = serde_json::from_slice(&header)
        .map_err(|e| invalid(format!("malformed header: {e}")))?;

    let mut names: Vec<String> = metadata.tensors().into_keys().collect();
    names.sort();
    Ok(names)
}

/// Checks that `tensors` carries what `config`'s task needs.
pub fn validate_transformer_keys(
    tensors: &HashMap<String, Tensor>,
    config: &WanConfig,
) -> Result<(), LoaderError> {
    let mut missing: Vec<String> = REQUIRED_TRANSFORMER_KEYS
        .iter()
        .filter(|k| !tensors.contains_key(**k))
        .map(|k| k.to_string())
        .collect();
    if config.is_i2v() && !tensors.keys().any(|k| k.starts_with(I2V_KEY_PREFIX)) {
        missing.push(format!("{I2V_KEY_PREFIX}*"));
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(LoaderError::MissingTensors { missing })
    }
}

/// Loads a transformer checkpoint, strips legacy keys and casts to `dtype`.
pub fn load_transformer_weights(
    path: impl AsRef<Path>,
    device: &Device,
    dtype: DType,
) -> Result<HashMap<String, Tensor>, LoaderError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(LoaderError::FileRead {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "checkpoint not found"),
        });
    }
    let tensors = candle_core::safetensors::load(path, device)?;
    let tensors = remap_state_dict(tensors)
        .into_iter()
        .map(|(k, v)| -> Result<(String, Tensor), LoaderError> { Ok((k, v.to_dtype(dtype)?)) })
        .collect::<Result<HashMap<_, _>, _>>()?;
    info!(path = %path.display(), tensors = tensors.len(), ?dtype, "loaded transformer weights");
    Ok(tensors)
}

/// `VarBuilder` over a transformer checkpoint with legacy keys remapped.
pub fn transformer_var_builder(
    path: impl AsRef<Path>,
    config: &WanConfig,
    device: &Device,
    dtype: DType,
) -> Result<VarBuilder<'static>, LoaderError> {
    let tensors = load_transformer_weights(path, device, dtype)?;
    validate_transformer_keys(&tensors, config)?;
    Ok(VarBuilder::from_tensors(tensors, dtype, device))
}

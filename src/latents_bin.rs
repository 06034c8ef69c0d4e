//! Raw latent dumps for inspecting or resuming decodes outside the pipeline.
//!
//! Format (little-endian):
//! - magic: 8 bytes, `WANLAT01`
//! - ndims: u32
//! - dims: ndims * u64
//! - data: f32 * product(dims), row-major

use candle_core::{DType, Device, Result, Tensor};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"WANLAT01";
const MAX_RANK: usize = 8;

pub fn write_latents(path: impl AsRef<Path>, tensor: &Tensor) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(MAGIC)?;
    out.write_all(&(tensor.rank() as u32).to_le_bytes())?;
    for d in tensor.dims() {
        out.write_all(&(*d as u64).to_le_bytes())?;
    }
    let values = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    for v in values {
        out.write_all(&v.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_latents(path: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut input = BufReader::new(file);

    let mut magic = [0u8; 8];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        candle_core::bail!("not a latent dump: bad magic {magic:?}");
    }

    let mut u32_buf = [0u8; 4];
    input.read_exact(&mut u32_buf)?;
    let rank = u32::from_le_bytes(u32_buf) as usize;
    if rank > MAX_RANK {
        candle_core::bail!("latent dump rank {rank} exceeds {MAX_RANK}");
    }

    let mut u64_buf = [0u8; 8];
    let mut dims = Vec::with_capacity(rank);
    for _ in 0..rank {
        input.read_exact(&mut u64_buf)?;
        dims.push(u64::from_le_bytes(u64_buf) as usize);
    }

    let header_len = (MAGIC.len() + 4 + rank * 8) as u64;
    let data_len = dims
        .iter()
        .try_fold(4usize, |acc, &d| acc.checked_mul(d))
        .filter(|&len| len as u64 == file_len.saturating_sub(header_len));
    let Some(data_len) = data_len else {
        candle_core::bail!(
            "latent dump dims {dims:?} do not match {} data bytes",
            file_len.saturating_sub(header_len)
        );
    };
    let mut bytes = vec![0u8; data_len];
    input.read_exact(&mut bytes)?;
    let data: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Tensor::from_vec(data, dims, device)
}

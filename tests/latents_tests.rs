//! Tests for latent shapes, initial noise, the latent buffer and latent dumps

use candle_core::{DType, Device, Result, Tensor};
use candle_wan::config::{InferenceConfig, LatentPlacement, NoiseLayout};
use candle_wan::latents_bin::{read_latents, write_latents};
use candle_wan::models::wan::configs::presets;
use candle_wan::models::wan::latents::{LatentBuffer, LatentShape, initial_noise};
use candle_wan::utils::deterministic_rng::Pcg32;

fn create_test_device() -> Device {
    Device::Cpu
}

fn small_shape() -> LatentShape {
    LatentShape::for_video(9, 32, 48, &presets::t2v_1_3b()).unwrap()
}

// ============================================================================
// Shape Tests
// ============================================================================

#[test]
fn test_latent_shape_from_inference_config() {
    let inf = InferenceConfig::new(81, 480, 832, 0).unwrap();
    let shape = LatentShape::for_inference(&inf, &presets::t2v_14b()).unwrap();
    assert_eq!(shape.dims(), (1, 16, 21, 60, 104));
    assert_eq!(shape.seq_len(presets::t2v_14b().patch_size), 32760);
}

#[test]
fn test_small_shape() {
    let shape = small_shape();
    assert_eq!(shape.dims(), (1, 16, 3, 4, 6));
    assert_eq!(shape.frame_dims(), (1, 16, 1, 4, 6));
    assert_eq!(shape.pixel_frames(4), 9);
}

// ============================================================================
// Noise Tests
// ============================================================================

#[test]
fn test_noise_is_seeded() -> Result<()> {
    let shape = small_shape();
    for layout in [NoiseLayout::PerFrame, NoiseLayout::Batched] {
        let a = initial_noise(&shape, &mut Pcg32::seeded(42), layout)?;
        let b = initial_noise(&shape, &mut Pcg32::seeded(42), layout)?;
        let c = initial_noise(&shape, &mut Pcg32::seeded(43), layout)?;
        assert_eq!(a.dims(), &[1, 16, 3, 4, 6]);
        assert_eq!(a.dtype(), DType::F32);
        assert_eq!(a.sub(&b)?.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        assert!(a.sub(&c)?.abs()?.sum_all()?.to_scalar::<f32>()? > 0.0);
    }
    Ok(())
}

#[test]
fn test_noise_layouts_differ() -> Result<()> {
    let shape = small_shape();
    let per_frame = initial_noise(&shape, &mut Pcg32::seeded(1), NoiseLayout::PerFrame)?;
    let batched = initial_noise(&shape, &mut Pcg32::seeded(1), NoiseLayout::Batched)?;
    assert!(per_frame.sub(&batched)?.abs()?.sum_all()?.to_scalar::<f32>()? > 0.0);
    Ok(())
}

#[test]
fn test_noise_is_standard_normal() -> Result<()> {
    let shape = LatentShape::for_video(33, 256, 256, &presets::t2v_1_3b()).unwrap();
    let noise = initial_noise(&shape, &mut Pcg32::seeded(7), NoiseLayout::PerFrame)?;
    let mean = noise.mean_all()?.to_scalar::<f32>()?;
    let var = noise.sqr()?.mean_all()?.to_scalar::<f32>()? - mean * mean;
    assert!(mean.abs() < 0.02, "mean {mean}");
    assert!((var - 1.0).abs() < 0.05, "variance {var}");
    Ok(())
}

// ============================================================================
// Buffer Tests
// ============================================================================

#[test]
fn test_lazy_buffer_lives_on_host() -> Result<()> {
    let device = create_test_device();
    let buffer = LatentBuffer::init_noise(
        small_shape(),
        &mut Pcg32::seeded(0),
        NoiseLayout::PerFrame,
        LatentPlacement::Lazy,
        &device,
    )?;
    assert!(buffer.is_host_resident());
    assert_eq!(buffer.placement(), LatentPlacement::Lazy);
    assert_eq!(buffer.shape(), &small_shape());

    let fwd = buffer.for_forward(DType::BF16)?;
    assert_eq!(fwd.dtype(), DType::BF16);
    assert_eq!(buffer.current().dtype(), DType::F32);
    Ok(())
}

#[test]
fn test_replace_keeps_shape_and_f32() -> Result<()> {
    let device = create_test_device();
    let mut buffer = LatentBuffer::from_tensor(
        Tensor::zeros((1, 16, 3, 4, 6), DType::F32, &device)?,
        LatentPlacement::Eager,
        &device,
    )?;
    buffer.replace(Tensor::ones((1, 16, 3, 4, 6), DType::BF16, &device)?)?;
    assert_eq!(buffer.current().dtype(), DType::F32);
    assert_eq!(buffer.current().sum_all()?.to_scalar::<f32>()?, (16 * 3 * 4 * 6) as f32);

    let wrong = Tensor::ones((1, 16, 2, 4, 6), DType::F32, &device)?;
    assert!(buffer.replace(wrong).is_err());
    assert_eq!(buffer.into_inner().dims(), &[1, 16, 3, 4, 6]);
    Ok(())
}

#[test]
fn test_buffer_rejects_non_video_tensor() -> Result<()> {
    let device = create_test_device();
    let flat = Tensor::zeros((16, 4, 6), DType::F32, &device)?;
    assert!(LatentBuffer::from_tensor(flat, LatentPlacement::Lazy, &device).is_err());
    Ok(())
}

// ============================================================================
// Latent Dump Tests
// ============================================================================

#[test]
fn test_latent_dump_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("sample.latent");
    let device = create_test_device();
    let latent = initial_noise(&small_shape(), &mut Pcg32::seeded(3), NoiseLayout::PerFrame)?;

    write_latents(&path, &latent)?;
    let loaded = read_latents(&path, &device)?;
    assert_eq!(loaded.dims(), latent.dims());
    assert_eq!(loaded.sub(&latent)?.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
    Ok(())
}

#[test]
fn test_latent_dump_rejects_foreign_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("not_latents.bin");
    std::fs::write(&path, b"GGUF\x03\x00\x00\x00 and more bytes")?;
    assert!(read_latents(&path, &create_test_device()).is_err());
    Ok(())
}

#[test]
fn test_latent_dump_rejects_truncated_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("short.latent");
    let latent = Tensor::ones((1, 16, 1, 2, 2), DType::F32, &create_test_device())?;
    write_latents(&path, &latent)?;
    let bytes = std::fs::read(&path)?;
    std::fs::write(&path, &bytes[..bytes.len() - 8])?;
    assert!(read_latents(&path, &create_test_device()).is_err());
    Ok(())
}

#[test]
fn test_latent_dump_rejects_oversized_dims() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("oversized.latent");
    let mut bytes = b"WANLAT01".to_vec();
    bytes.extend_from_slice(&2u32.to_le_bytes());
    bytes.extend_from_slice(&u64::MAX.to_le_bytes());
    bytes.extend_from_slice(&3u64.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 16]);
    std::fs::write(&path, &bytes)?;
    assert!(read_latents(&path, &create_test_device()).is_err());

    // Fits in memory but claims far more data than the file holds
    let mut bytes = b"WANLAT01".to_vec();
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&(1u64 << 40).to_le_bytes());
    std::fs::write(&path, &bytes)?;
    assert!(read_latents(&path, &create_test_device()).is_err());
    Ok(())
}

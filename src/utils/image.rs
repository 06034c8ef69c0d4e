//! Conditioning-image loading and frame export.

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ImageLoadError {
    #[error("failed to read image {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Scales `img` so it covers `width` x `height`, then centre-crops to exactly that size.
pub fn resize_image_to_bucket(img: &DynamicImage, width: u32, height: u32) -> RgbImage {
    let (w0, h0) = (img.width().max(1), img.height().max(1));
    let scale = f64::max(width as f64 / w0 as f64, height as f64 / h0 as f64);
    let rw = ((w0 as f64 * scale).round() as u32).max(width);
    let rh = ((h0 as f64 * scale).round() as u32).max(height);

    let resized = img.resize_exact(rw, rh, FilterType::Lanczos3).to_rgb8();
    let left = (rw - width) / 2;
    let top = (rh - height) / 2;
    image::imageops::crop_imm(&resized, left, top, width, height).to_image()
}

/// RGB image as a `[3, 1, H, W]` tensor in `[-1, 1]`.
pub fn image_to_tensor(img: &RgbImage, device: &Device) -> candle_core::Result<Tensor> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    Tensor::from_vec(img.as_raw().clone(), (h, w, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 127.5, -1.0)?
        .unsqueeze(1)
}

/// Loads a conditioning image at the sample's resolution, on the host.
pub fn load_conditioning_image(
    path: impl AsRef<Path>,
    width: usize,
    height: usize,
) -> Result<Tensor, ImageLoadError> {
    let path = path.as_ref();
    let img = image::open(path).map_err(|source| ImageLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let img = resize_image_to_bucket(&img, width as u32, height as u32);
    Ok(image_to_tensor(&img, &Device::Cpu)?)
}

/// Converts a `[3, F, H, W]` video in `[0, 1]` to per-frame RGB8 buffers.
pub fn video_to_rgb_frames(video: &Tensor) -> candle_core::Result<Vec<Vec<u8>>> {
    let (_, frames, _, _) = video.dims4()?;
    let video = video
        .affine(255.0, 0.0)?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        .permute((1, 2, 3, 0))?
        .contiguous()?;
    (0..frames)
        .map(|f| video.get(f)?.flatten_all()?.to_vec1::<u8>())
        .collect()
}

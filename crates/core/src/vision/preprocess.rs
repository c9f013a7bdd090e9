use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;
use tracing::debug;

use crate::constants::IMAGE_SIZE;

/// Per-channel normalization the SigLIP encoder was trained with.
const MEAN: f32 = 0.5;
const STD: f32 = 0.5;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Input is null or empty")]
    EmptyInput,
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Resize failed: unexpected buffer shape")]
    Resize,
}

/// Decode image bytes into the planar `1 x 3 x 896 x 896` float tensor the
/// vision encoder consumes.
///
/// Alpha channels are flattened to RGB and animated inputs contribute their
/// first frame only. The decoded full-resolution image is dropped before the
/// float buffer is allocated, so it and the output are never live together.
pub fn planar_pixel_values(bytes: &[u8]) -> Result<Vec<f32>, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::EmptyInput);
    }

    let side = IMAGE_SIZE as u32;
    let resized: RgbImage = {
        let decoded = image::load_from_memory(bytes)
            .map_err(|err| ImageError::Decode(err.to_string()))?;
        debug!(
            "decoded image {}x{} ({:?})",
            decoded.width(),
            decoded.height(),
            decoded.color()
        );
        let rgb = decoded.into_rgb8();
        imageops::resize(&rgb, side, side, FilterType::Triangle)
        // both the decoded image and the pre-resize RGB buffer die here
    };

    let area = IMAGE_SIZE * IMAGE_SIZE;
    let interleaved = resized.into_raw();
    if interleaved.len() != 3 * area {
        return Err(ImageError::Resize);
    }

    let mut pixel_values = vec![0f32; 3 * area];
    for (index, px) in interleaved.chunks_exact(3).enumerate() {
        for (channel, &value) in px.iter().enumerate() {
            pixel_values[channel * area + index] = (value as f32 / 255.0 - MEAN) / STD;
        }
    }
    debug!(
        "planar pixel tensor ready: {} floats ({:.1} MiB)",
        pixel_values.len(),
        (pixel_values.len() * 4) as f32 / (1024.0 * 1024.0)
    );
    Ok(pixel_values)
}

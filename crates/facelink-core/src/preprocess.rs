//! Decoding and normalization of client-submitted photos.
//!
//! Client photos arrive at arbitrary sizes and quality. Before detection they
//! are upscaled to a minimum size, contrast-equalized on the lightness
//! channel, and denoised with an edge-preserving filter.

use crate::color;
use crate::filters;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use thiserror::Error;

/// Minimum width and height fed to the detectors.
pub const MIN_DIMENSION: u32 = 224;

const CLAHE_CLIP_LIMIT: f32 = 2.0;
const CLAHE_TILES: u32 = 8;
const BILATERAL_DIAMETER: u32 = 9;
const BILATERAL_SIGMA_COLOR: f32 = 75.0;
const BILATERAL_SIGMA_SPACE: f32 = 75.0;

/// Largest raster the pipeline will work on, after upscaling.
pub const MAX_PIXELS: u64 = 50_000_000;

/// Maximum decoded payload size (10 MiB).
const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image data is empty")]
    EmptyData,
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("image data is too large: {0} bytes (max: {1} bytes)")]
    TooLarge(usize, usize),
    #[error("failed to decode image: {0}")]
    DecodeFailed(String),
    #[error("image would be {width}x{height} pixels (max: {max} pixels)")]
    TooManyPixels { width: u32, height: u32, max: u64 },
    #[error("image dimensions are zero")]
    ZeroDimensions,
    #[error("failed to encode image: {0}")]
    EncodeFailed(String),
}

/// Decode a base64 payload, with or without a `data:<mime>;base64,` prefix.
pub fn decode_base64_image(payload: &str) -> Result<RgbImage, ImageError> {
    let encoded = match payload.split_once(',') {
        Some((_, rest)) => rest,
        None => payload,
    };
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(ImageError::EmptyData);
    }

    let bytes = STANDARD.decode(encoded)?;
    decode_image_bytes(&bytes)
}

/// Decode raw encoded image bytes (JPEG, PNG, ...) into an RGB raster.
pub fn decode_image_bytes(bytes: &[u8]) -> Result<RgbImage, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::EmptyData);
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ImageError::TooLarge(bytes.len(), MAX_IMAGE_BYTES));
    }

    let img = image::load_from_memory(bytes)
        .map_err(|e| ImageError::DecodeFailed(e.to_string()))?
        .to_rgb8();

    if img.width() == 0 || img.height() == 0 {
        return Err(ImageError::ZeroDimensions);
    }
    Ok(img)
}

/// Encode an RGB raster as JPEG.
pub fn encode_jpeg(img: &RgbImage) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(Cursor::new(&mut buf), JPEG_QUALITY);
    img.write_with_encoder(encoder)
        .map_err(|e| ImageError::EncodeFailed(e.to_string()))?;
    Ok(buf)
}

/// Encode an RGB raster in the given container format.
pub fn encode_image(img: &RgbImage, format: ImageFormat) -> Result<Vec<u8>, ImageError> {
    if format == ImageFormat::Jpeg {
        return encode_jpeg(img);
    }
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format)
        .map_err(|e| ImageError::EncodeFailed(e.to_string()))?;
    Ok(buf.into_inner())
}

/// Target dimensions so that both sides reach `min`, preserving aspect ratio.
/// Returns `None` when the image is already large enough.
pub fn upscaled_dimensions(width: u32, height: u32, min: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 || (width >= min && height >= min) {
        return None;
    }
    let scale = (min as f64 / width as f64).max(min as f64 / height as f64);
    let new_w = ((width as f64 * scale).round() as u32).max(1);
    let new_h = ((height as f64 * scale).round() as u32).max(1);
    Some((new_w, new_h))
}

/// Reject rasters larger than [`MAX_PIXELS`].
pub fn check_pixel_count(width: u32, height: u32) -> Result<(), ImageError> {
    if width as u64 * height as u64 > MAX_PIXELS {
        return Err(ImageError::TooManyPixels {
            width,
            height,
            max: MAX_PIXELS,
        });
    }
    Ok(())
}

/// Upscale with cubic interpolation if either side is below `min`. Fails
/// before allocating when the result would exceed [`MAX_PIXELS`].
pub fn upscale_to_minimum(img: RgbImage, min: u32) -> Result<RgbImage, ImageError> {
    let target = upscaled_dimensions(img.width(), img.height(), min);
    let (w, h) = target.unwrap_or(img.dimensions());
    check_pixel_count(w, h)?;

    Ok(match target {
        Some((w, h)) => {
            tracing::debug!(
                from_width = img.width(),
                from_height = img.height(),
                to_width = w,
                to_height = h,
                "upscaling image"
            );
            image::imageops::resize(&img, w, h, FilterType::CatmullRom)
        }
        None => img,
    })
}

/// Equalize local contrast on the L*a*b* lightness channel only.
pub fn equalize_lightness(img: &RgbImage) -> RgbImage {
    let mut planes = color::split_lab(img);
    filters::clahe_enhance(
        &mut planes.l,
        planes.width,
        planes.height,
        CLAHE_TILES,
        CLAHE_TILES,
        CLAHE_CLIP_LIMIT,
    );
    color::merge_lab(&planes)
}

/// Full normalization pipeline: minimum size, lightness CLAHE, bilateral denoise.
pub fn preprocess(img: RgbImage) -> Result<RgbImage, ImageError> {
    let (orig_w, orig_h) = img.dimensions();
    let img = upscale_to_minimum(img, MIN_DIMENSION)?;
    let img = equalize_lightness(&img);
    let img = filters::bilateral_filter(
        &img,
        BILATERAL_DIAMETER,
        BILATERAL_SIGMA_COLOR,
        BILATERAL_SIGMA_SPACE,
    );
    tracing::debug!(
        orig_width = orig_w,
        orig_height = orig_h,
        width = img.width(),
        height = img.height(),
        "preprocessed image"
    );
    Ok(img)
}

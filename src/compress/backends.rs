//! Interchangeable encoder backends.
//!
//! Each backend decodes, applies the preset's resize bound and re-encodes.
//! They differ in resize filter and in which formats they accept; the
//! lossless backend never applies quality scaling.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use super::presets::{CompressionPreset, OutputFormat};
use crate::error::CompressError;

/// Backend selector carried by presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Bilinear resize, lossy encoders.
    Fast,
    /// Lanczos resize, lossy encoders.
    Quality,
    /// PNG and lossless WebP only.
    Lossless,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        self.implementation().name()
    }

    pub fn supports(&self, format: OutputFormat) -> bool {
        !matches!((self, format), (Backend::Lossless, OutputFormat::Jpeg))
    }

    pub fn implementation(&self) -> &'static dyn CompressionBackend {
        match self {
            Backend::Fast => &FastBackend,
            Backend::Quality => &QualityBackend,
            Backend::Lossless => &LosslessBackend,
        }
    }
}

/// Output of a backend before the engine adds sizes and timings.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub mime_type: &'static str,
}

pub trait CompressionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, bytes: &[u8], preset: &CompressionPreset) -> Result<EncodedImage, CompressError>;
}

pub struct FastBackend;
pub struct QualityBackend;
pub struct LosslessBackend;

impl CompressionBackend for FastBackend {
    fn name(&self) -> &'static str {
        "fast"
    }

    fn encode(&self, bytes: &[u8], preset: &CompressionPreset) -> Result<EncodedImage, CompressError> {
        let img = decode_and_fit(bytes, preset, FilterType::Triangle)?;
        encode_lossy(&img, preset)
    }
}

impl CompressionBackend for QualityBackend {
    fn name(&self) -> &'static str {
        "quality"
    }

    fn encode(&self, bytes: &[u8], preset: &CompressionPreset) -> Result<EncodedImage, CompressError> {
        let img = decode_and_fit(bytes, preset, FilterType::Lanczos3)?;
        encode_lossy(&img, preset)
    }
}

impl CompressionBackend for LosslessBackend {
    fn name(&self) -> &'static str {
        "lossless"
    }

    fn encode(&self, bytes: &[u8], preset: &CompressionPreset) -> Result<EncodedImage, CompressError> {
        let img = decode_and_fit(bytes, preset, FilterType::CatmullRom)?;
        let out = match preset.format {
            OutputFormat::Png => encode_png(&img)?,
            OutputFormat::Webp => encode_webp_lossless(&img)?,
            OutputFormat::Jpeg => {
                return Err(CompressError::Unsupported {
                    backend: self.name(),
                    format: preset.format.as_str(),
                })
            }
        };
        Ok(finish(out, &img, preset.format))
    }
}

/// Scale `(width, height)` down to fit within the bounds, keeping the aspect
/// ratio. `None` when it already fits.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 || (width <= max_width && height <= max_height) {
        return None;
    }
    let ratio = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let new_width = ((width as f64 * ratio).round() as u32).clamp(1, max_width.max(1));
    let new_height = ((height as f64 * ratio).round() as u32).clamp(1, max_height.max(1));
    Some((new_width, new_height))
}

fn decode_and_fit(
    bytes: &[u8],
    preset: &CompressionPreset,
    filter: FilterType,
) -> Result<DynamicImage, CompressError> {
    let img = image::load_from_memory(bytes)?;
    if !preset.auto_resize {
        return Ok(img);
    }
    match fit_within(img.width(), img.height(), preset.max_width, preset.max_height) {
        Some((w, h)) => Ok(img.resize_exact(w, h, filter)),
        None => Ok(img),
    }
}

fn encode_lossy(img: &DynamicImage, preset: &CompressionPreset) -> Result<EncodedImage, CompressError> {
    let out = match preset.format {
        OutputFormat::Jpeg => encode_jpeg(img, preset.quality)?,
        // PNG has no quality knob
        OutputFormat::Png => encode_png(img)?,
        OutputFormat::Webp => encode_webp(img, preset.quality)?,
    };
    Ok(finish(out, img, preset.format))
}

fn finish(bytes: Vec<u8>, img: &DynamicImage, format: OutputFormat) -> EncodedImage {
    EncodedImage {
        bytes,
        width: img.width(),
        height: img.height(),
        mime_type: format.mime_type(),
    }
}

fn encode_error(e: impl std::fmt::Display) -> CompressError {
    CompressError::Encode(e.to_string())
}

fn encode_jpeg(img: &DynamicImage, quality: f32) -> Result<Vec<u8>, CompressError> {
    let quality = (quality * 100.0).round().clamp(1.0, 100.0) as u8;
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    // JPEG has no alpha channel
    DynamicImage::ImageRgb8(img.to_rgb8())
        .write_with_encoder(encoder)
        .map_err(encode_error)?;
    Ok(out)
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, CompressError> {
    let mut out = Vec::new();
    let encoder = PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilter::Adaptive);
    img.write_with_encoder(encoder).map_err(encode_error)?;
    Ok(out)
}

/// libwebp only takes 8-bit RGB or RGBA buffers.
fn to_webp_input(img: &DynamicImage) -> DynamicImage {
    if img.color().has_alpha() {
        DynamicImage::ImageRgba8(img.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.to_rgb8())
    }
}

fn encode_webp(img: &DynamicImage, quality: f32) -> Result<Vec<u8>, CompressError> {
    let input = to_webp_input(img);
    let encoder = webp::Encoder::from_image(&input).map_err(encode_error)?;
    let encoded = encoder.encode((quality * 100.0).clamp(1.0, 100.0));
    Ok(encoded.to_vec())
}

fn encode_webp_lossless(img: &DynamicImage) -> Result<Vec<u8>, CompressError> {
    let mut out = Vec::new();
    let encoder = WebPEncoder::new_lossless(&mut out);
    to_webp_input(img)
        .write_with_encoder(encoder)
        .map_err(encode_error)?;
    Ok(out)
}

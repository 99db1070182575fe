//! Best-effort image compression.
//!
//! [`compress`] never fails and never loses the input: when a backend errors
//! the original bytes come back with zero savings and the reason in
//! [`CompressedResult::degraded`].

pub mod backends;
pub mod presets;

use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use backends::{Backend, CompressionBackend, EncodedImage};
pub use presets::{
    find_preset, presets, resolve_preset, CompressionPreset, CustomPreset, OutputFormat,
    CUSTOM_PRESET, DEFAULT_PRESET,
};

use crate::db::records::probe;
use crate::db::CompressionInfo;

#[derive(Debug, Clone)]
pub struct CompressedResult {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    pub original_size: u64,
    pub savings_percent: f64,
    pub mime_type: String,
    pub preset: String,
    pub backend: Backend,
    pub quality: f32,
    pub processing_time: Duration,
    /// Why the input was passed through unchanged, when compression failed.
    pub degraded: Option<String>,
}

impl CompressedResult {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn space_saved(&self) -> u64 {
        self.original_size.saturating_sub(self.size_bytes)
    }

    pub fn compression_info(&self) -> CompressionInfo {
        CompressionInfo {
            preset: self.preset.clone(),
            backend: self.backend.as_str().to_string(),
            quality: self.quality,
            original_size: self.original_size,
            compression_time_ms: self.processing_time.as_millis() as u64,
            savings_percent: self.savings_percent,
        }
    }
}

/// `(original - compressed) / original * 100`, clamped to `[0, 100]`.
pub fn savings_percent(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    let saved = (original_size as f64 - compressed_size as f64) / original_size as f64 * 100.0;
    saved.clamp(0.0, 100.0)
}

/// Compress `bytes` with `preset`'s backend.
pub fn compress(bytes: &[u8], preset: &CompressionPreset) -> CompressedResult {
    let started = Instant::now();
    let original_size = bytes.len() as u64;
    let backend = preset.backend.implementation();

    match backend.encode(bytes, preset) {
        Ok(encoded) => {
            let (input_mime, input_width, input_height) = probe(bytes);
            if encoded.bytes.len() as u64 >= original_size && input_mime == encoded.mime_type {
                // Re-encoding into the same format only made it bigger
                debug!(
                    "Preset {} did not shrink {} image ({} -> {} bytes); keeping input",
                    preset.name,
                    input_mime,
                    original_size,
                    encoded.bytes.len()
                );
                return CompressedResult {
                    bytes: bytes.to_vec(),
                    width: input_width,
                    height: input_height,
                    size_bytes: original_size,
                    original_size,
                    savings_percent: 0.0,
                    mime_type: input_mime,
                    preset: preset.name.to_string(),
                    backend: preset.backend,
                    quality: preset.quality,
                    processing_time: started.elapsed(),
                    degraded: None,
                };
            }

            let size_bytes = encoded.bytes.len() as u64;
            let savings = savings_percent(original_size, size_bytes);
            debug!(
                "Compressed {} -> {} bytes ({:.1}% saved) with {}/{}",
                original_size,
                size_bytes,
                savings,
                preset.name,
                backend.name()
            );
            CompressedResult {
                bytes: encoded.bytes,
                width: encoded.width,
                height: encoded.height,
                size_bytes,
                original_size,
                savings_percent: savings,
                mime_type: encoded.mime_type.to_string(),
                preset: preset.name.to_string(),
                backend: preset.backend,
                quality: preset.quality,
                processing_time: started.elapsed(),
                degraded: None,
            }
        }
        Err(e) => {
            warn!(
                "Compression with {}/{} failed, keeping original: {}",
                preset.name,
                backend.name(),
                e
            );
            let (mime_type, width, height) = probe(bytes);
            CompressedResult {
                bytes: bytes.to_vec(),
                width,
                height,
                size_bytes: original_size,
                original_size,
                savings_percent: 0.0,
                mime_type,
                preset: preset.name.to_string(),
                backend: preset.backend,
                quality: preset.quality,
                processing_time: started.elapsed(),
                degraded: Some(e.to_string()),
            }
        }
    }
}

//! Named compression presets.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use super::backends::Backend;
use crate::error::PresetError;

/// Preset used for web-use copies unless settings say otherwise.
pub const DEFAULT_PRESET: &str = "webp-strong";

/// Name of the pseudo-preset built from user overrides.
pub const CUSTOM_PRESET: &str = "custom";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionPreset {
    pub name: Cow<'static, str>,
    pub description: Cow<'static, str>,
    pub max_width: u32,
    pub max_height: u32,
    /// Encoder quality in (0, 1]. Ignored by the lossless backend.
    pub quality: f32,
    pub format: OutputFormat,
    pub backend: Backend,
    pub auto_resize: bool,
}

const fn preset(
    name: &'static str,
    description: &'static str,
    max_side: (u32, u32),
    quality: f32,
    format: OutputFormat,
    backend: Backend,
) -> CompressionPreset {
    CompressionPreset {
        name: Cow::Borrowed(name),
        description: Cow::Borrowed(description),
        max_width: max_side.0,
        max_height: max_side.1,
        quality,
        format,
        backend,
        auto_resize: true,
    }
}

static PRESETS: [CompressionPreset; 10] = [
    preset("ultra-high", "Near-lossless JPEG for archival views", (4096, 4096), 0.95, OutputFormat::Jpeg, Backend::Quality),
    preset("high", "High quality JPEG", (2560, 2560), 0.88, OutputFormat::Jpeg, Backend::Quality),
    preset("balanced", "General purpose JPEG", (1920, 1920), 0.80, OutputFormat::Jpeg, Backend::Fast),
    preset("webp-high", "High quality WebP", (2560, 2560), 0.90, OutputFormat::Webp, Backend::Quality),
    preset("webp-balanced", "Balanced WebP for chat display", (1920, 1920), 0.80, OutputFormat::Webp, Backend::Quality),
    preset("webp-strong", "Strong WebP compression for inline display", (1280, 1280), 0.70, OutputFormat::Webp, Backend::Fast),
    preset("webp-compact", "Small WebP for previews", (1024, 1024), 0.60, OutputFormat::Webp, Backend::Fast),
    preset("compact", "Small JPEG for previews", (1024, 1024), 0.60, OutputFormat::Jpeg, Backend::Fast),
    preset("compact-max", "Smallest JPEG thumbnails", (640, 640), 0.45, OutputFormat::Jpeg, Backend::Fast),
    preset("png-lossless", "Lossless PNG recompression", (4096, 4096), 1.0, OutputFormat::Png, Backend::Lossless),
];

/// All registered presets, in quality order.
pub fn presets() -> &'static [CompressionPreset] {
    &PRESETS
}

/// Look up a registered preset. `"custom"` is not in the registry; build it
/// via [`CustomPreset::build`] or [`resolve_preset`].
pub fn find_preset(name: &str) -> Result<CompressionPreset, PresetError> {
    PRESETS
        .iter()
        .find(|p| p.name == name)
        .cloned()
        .ok_or_else(|| PresetError::Unknown(name.to_string()))
}

/// Resolve a preset name, using `custom` when the name is `"custom"`.
pub fn resolve_preset(
    name: &str,
    custom: Option<&CustomPreset>,
) -> Result<CompressionPreset, PresetError> {
    if name == CUSTOM_PRESET {
        return custom
            .ok_or_else(|| PresetError::Invalid("no custom preset configured".to_string()))?
            .build();
    }
    find_preset(name)
}

/// User overrides for the `custom` preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPreset {
    #[serde(default = "default_custom_max_side")]
    pub max_width: u32,
    #[serde(default = "default_custom_max_side")]
    pub max_height: u32,
    #[serde(default = "default_custom_quality")]
    pub quality: f32,
    #[serde(default = "default_custom_format")]
    pub format: OutputFormat,
    #[serde(default = "default_custom_backend")]
    pub backend: Backend,
    #[serde(default = "default_auto_resize")]
    pub auto_resize: bool,
}

fn default_custom_max_side() -> u32 {
    1920
}

fn default_custom_quality() -> f32 {
    0.8
}

fn default_custom_format() -> OutputFormat {
    OutputFormat::Webp
}

fn default_custom_backend() -> Backend {
    Backend::Quality
}

fn default_auto_resize() -> bool {
    true
}

impl Default for CustomPreset {
    fn default() -> Self {
        Self {
            max_width: default_custom_max_side(),
            max_height: default_custom_max_side(),
            quality: default_custom_quality(),
            format: default_custom_format(),
            backend: default_custom_backend(),
            auto_resize: default_auto_resize(),
        }
    }
}

impl CustomPreset {
    pub fn build(&self) -> Result<CompressionPreset, PresetError> {
        if !(self.quality > 0.0 && self.quality <= 1.0) {
            return Err(PresetError::Invalid(format!(
                "quality must be in (0, 1], got {}",
                self.quality
            )));
        }
        if self.max_width == 0 || self.max_height == 0 {
            return Err(PresetError::Invalid(
                "max_width and max_height must be positive".to_string(),
            ));
        }
        if !self.backend.supports(self.format) {
            return Err(PresetError::Invalid(format!(
                "backend {} cannot produce {}",
                self.backend.as_str(),
                self.format.as_str()
            )));
        }
        Ok(CompressionPreset {
            name: Cow::Borrowed(CUSTOM_PRESET),
            description: Cow::Borrowed("User-defined settings"),
            max_width: self.max_width,
            max_height: self.max_height,
            quality: self.quality,
            format: self.format,
            backend: self.backend,
            auto_resize: self.auto_resize,
        })
    }
}

//! Error types for the image vault.
//!
//! Lookups never fail: a miss is `Option::None`. Errors here are reserved for
//! writes, configuration and job validation.

use thiserror::Error;

/// Errors raised by the record stores, the recycle bin and the settings table.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The persistence backend is missing, failed to open or its lock is poisoned.
    #[error("Image storage is not available")]
    Unavailable,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The payload could not be turned into bytes (bad data URI, empty input).
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl StoreError {
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// True when the error means "storage not available" rather than a failed statement.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Preset lookup and custom preset validation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PresetError {
    #[error("Unknown compression preset: {0}")]
    Unknown(String),

    #[error("Invalid custom preset: {0}")]
    Invalid(String),
}

/// Failures inside a compression backend. These never leave the engine;
/// they are folded into a degraded [`crate::compress::CompressedResult`].
#[derive(Error, Debug)]
pub enum CompressError {
    #[error("Decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Backend {backend} cannot produce {format}")]
    Unsupported {
        backend: &'static str,
        format: &'static str,
    },
}

/// Rejections raised before a batch starts. Per-item failures are not errors.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Concurrency must be between {min} and {max}, got {got}")]
    Concurrency { got: usize, min: usize, max: usize },

    #[error(transparent)]
    Preset(#[from] PresetError),
}

pub type StoreResult<T> = Result<T, StoreError>;

//! Background maintenance jobs over stored images.
//!
//! Jobs run on the tokio runtime; CPU-bound per-item work runs on the
//! blocking pool via `spawn_blocking`.

pub mod batch;

use serde::Serialize;

use crate::pipeline::PipelineResult;

pub use batch::{run_batch, BatchRunner};

/// Smallest accepted batch concurrency.
pub const MIN_CONCURRENCY: usize = 1;
/// Largest accepted batch concurrency.
pub const MAX_CONCURRENCY: usize = 5;

/// Outcome of one item in a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub id: String,
    pub success: bool,
    pub error: Option<String>,
    pub result: Option<PipelineResult>,
}

impl BatchItemResult {
    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            error: Some(error.into()),
            result: None,
        }
    }

    pub fn space_saved(&self) -> u64 {
        self.result.as_ref().map(|r| r.space_saved()).unwrap_or(0)
    }
}

impl From<PipelineResult> for BatchItemResult {
    fn from(result: PipelineResult) -> Self {
        Self {
            id: result.original_id.clone(),
            success: result.success,
            error: result.error.clone(),
            result: Some(result),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchJobResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_space_saved: u64,
    /// Highest number of items observed running at once.
    pub peak_in_flight: usize,
    /// In completion order.
    pub per_item: Vec<BatchItemResult>,
}

/// Progress information handed to batch callbacks.
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
}

impl BatchProgress {
    /// Progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.completed as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }
}

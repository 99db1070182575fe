//! Two-tier image storage and compression for chat attachments.

pub mod compress;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod reorganize;
pub mod tasks;
pub mod trash;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use db::{Database, ImageRecord, ImageStore, Tier};
pub use pipeline::{IngestOptions, Pipeline, PipelineResult};
pub use reorganize::{ReorgResult, Reorganizer};
pub use tasks::{BatchItemResult, BatchJobResult, BatchRunner};
pub use trash::RecycleBin;

//! Bounded-concurrency recompression of stored originals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{BatchItemResult, BatchJobResult, BatchProgress, MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::compress::{find_preset, CompressionPreset};
use crate::error::BatchError;
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct BatchRunner {
    pipeline: Arc<Pipeline>,
}

impl BatchRunner {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    /// Recompress every id with the named preset, at most `concurrency` at a
    /// time. `on_progress` runs once per finished item, in completion order.
    pub async fn run<F>(
        &self,
        ids: Vec<String>,
        preset_name: &str,
        concurrency: usize,
        on_progress: F,
    ) -> Result<BatchJobResult, BatchError>
    where
        F: FnMut(BatchProgress, &BatchItemResult),
    {
        let preset = find_preset(preset_name)?;
        self.run_with_preset(ids, preset, concurrency, on_progress).await
    }

    pub async fn run_with_preset<F>(
        &self,
        ids: Vec<String>,
        preset: CompressionPreset,
        concurrency: usize,
        mut on_progress: F,
    ) -> Result<BatchJobResult, BatchError>
    where
        F: FnMut(BatchProgress, &BatchItemResult),
    {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(BatchError::Concurrency {
                got: concurrency,
                min: MIN_CONCURRENCY,
                max: MAX_CONCURRENCY,
            });
        }

        let total = ids.len();
        info!(
            "Starting batch of {} images with preset {} ({} workers)",
            total, preset.name, concurrency
        );

        let preset = Arc::new(preset);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();
        let mut task_ids = HashMap::new();

        for id in ids {
            let pipeline = self.pipeline.clone();
            let preset = preset.clone();
            let semaphore = semaphore.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            let item_id = id.clone();

            let handle = tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return BatchItemResult::failed(item_id, format!("worker unavailable: {}", e))
                    }
                };
                let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(running, Ordering::SeqCst);
                debug!("Worker started for {} ({} in flight)", item_id, running);

                let work_id = item_id.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || pipeline.reoptimize(&work_id, Some(&*preset)))
                        .await;
                in_flight.fetch_sub(1, Ordering::SeqCst);

                match outcome {
                    Ok(result) => BatchItemResult::from(result),
                    Err(e) => BatchItemResult::failed(item_id, format!("worker failed: {}", e)),
                }
            });
            task_ids.insert(handle.id(), id);
        }

        let mut job = BatchJobResult {
            total,
            ..BatchJobResult::default()
        };

        while let Some(joined) = tasks.join_next_with_id().await {
            let item = match joined {
                Ok((_, item)) => item,
                Err(e) => {
                    let id = task_ids.get(&e.id()).cloned().unwrap_or_default();
                    warn!("Batch task for {} did not finish: {}", id, e);
                    BatchItemResult::failed(id, e.to_string())
                }
            };

            if item.success {
                job.successful += 1;
                job.total_space_saved += item.space_saved();
            } else {
                job.failed += 1;
                debug!(
                    "Batch item {} failed: {}",
                    item.id,
                    item.error.as_deref().unwrap_or("unknown error")
                );
            }

            let progress = BatchProgress {
                completed: job.successful + job.failed,
                total,
            };
            on_progress(progress, &item);
            job.per_item.push(item);
        }

        job.peak_in_flight = peak.load(Ordering::SeqCst);
        info!(
            "Batch finished: {} ok, {} failed, {} bytes saved",
            job.successful, job.failed, job.total_space_saved
        );
        Ok(job)
    }
}

/// One-shot form of [`BatchRunner::run`].
pub async fn run_batch<F>(
    pipeline: Arc<Pipeline>,
    ids: Vec<String>,
    preset_name: &str,
    concurrency: usize,
    on_progress: F,
) -> Result<BatchJobResult, BatchError>
where
    F: FnMut(BatchProgress, &BatchItemResult),
{
    BatchRunner::new(pipeline)
        .run(ids, preset_name, concurrency, on_progress)
        .await
}

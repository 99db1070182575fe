//! Ingest and read paths for chat images.
//!
//! Every image lands in the original tier first, then a compressed copy is
//! written to the web-use tier under `opt_<id>`. The two writes are not a
//! transaction: if the second one fails the original stays, and running
//! `ingest` (or `reoptimize`) again for the same id is safe.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::compress::{compress, find_preset, savings_percent, CompressionPreset, DEFAULT_PRESET};
use crate::db::{
    optimized_id, original_id, Database, DeletionReason, ImageMetadata, ImagePayload, ImageRecord,
    ImageSource, ImageStore, MetadataExtra, PutOutcome, RecordMeta, SettingsStore, Tier,
    OPTIMIZED_PREFIX,
};
use crate::error::{StoreError, StoreResult};
use crate::trash::RecycleBin;

/// Per-call overrides for [`Pipeline::ingest`].
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub source: ImageSource,
    pub mime_type: Option<String>,
    /// Replaces the pipeline's default preset for this image.
    pub preset: Option<CompressionPreset>,
    pub extra: Option<MetadataExtra>,
}

impl IngestOptions {
    pub fn uploaded() -> Self {
        Self {
            source: ImageSource::Uploaded,
            ..Self::default()
        }
    }

    pub fn with_preset(mut self, preset: CompressionPreset) -> Self {
        self.preset = Some(preset);
        self
    }

    pub fn with_extra(mut self, extra: MetadataExtra) -> Self {
        self.extra = Some(extra);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    pub original_id: String,
    pub optimized_id: String,
    pub original_size: u64,
    pub optimized_size: u64,
    pub savings_percent: f64,
    pub success: bool,
    pub error: Option<String>,
    /// Set when the failure was "storage not available" rather than a bad image.
    pub storage_unavailable: bool,
}

impl PipelineResult {
    fn new(id: &str) -> Self {
        Self {
            original_id: original_id(id).to_string(),
            optimized_id: optimized_id(id),
            original_size: 0,
            optimized_size: 0,
            savings_percent: 0.0,
            success: false,
            error: None,
            storage_unavailable: false,
        }
    }

    fn failed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(message.into());
        self
    }

    fn store_failed(mut self, err: &StoreError) -> Self {
        self.storage_unavailable = err.is_unavailable();
        self.failed(err.to_string())
    }

    pub fn space_saved(&self) -> u64 {
        if self.success {
            self.original_size.saturating_sub(self.optimized_size)
        } else {
            0
        }
    }
}

/// Content-derived image id for callers that have none.
pub fn content_id(bytes: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(bytes));
    format!("img_{}", &digest[..16])
}

pub struct Pipeline {
    original: ImageStore,
    webuse: ImageStore,
    recycle: RecycleBin,
    default_preset: CompressionPreset,
}

impl Pipeline {
    /// Wire the pipeline from explicitly constructed stores. `original` and
    /// `webuse` must be the matching tiers.
    pub fn new(original: ImageStore, webuse: ImageStore, recycle: RecycleBin) -> StoreResult<Self> {
        if original.tier() != Tier::Original || webuse.tier() != Tier::WebUse {
            return Err(StoreError::invalid_payload(format!(
                "pipeline needs original/webuse stores, got {}/{}",
                original.tier(),
                webuse.tier()
            )));
        }
        let default_preset = match find_preset(DEFAULT_PRESET) {
            Ok(preset) => preset,
            Err(e) => return Err(StoreError::invalid_payload(e.to_string())),
        };
        Ok(Self {
            original,
            webuse,
            recycle,
            default_preset,
        })
    }

    /// Both tiers and the recycle bin over one database, with the active
    /// preset from the settings table.
    pub fn open(db: &Database, recycle: RecycleBin) -> StoreResult<Self> {
        let preset = SettingsStore::new(db.clone()).active_preset();
        Ok(Self::new(
            ImageStore::new(db.clone(), Tier::Original),
            ImageStore::new(db.clone(), Tier::WebUse),
            recycle,
        )?
        .with_default_preset(preset))
    }

    pub fn with_default_preset(mut self, preset: CompressionPreset) -> Self {
        self.default_preset = preset;
        self
    }

    pub fn default_preset(&self) -> &CompressionPreset {
        &self.default_preset
    }

    pub fn original(&self) -> &ImageStore {
        &self.original
    }

    pub fn webuse(&self) -> &ImageStore {
        &self.webuse
    }

    pub fn recycle_bin(&self) -> &RecycleBin {
        &self.recycle
    }

    pub fn store_for(&self, tier: Tier) -> &ImageStore {
        match tier {
            Tier::Original => &self.original,
            Tier::WebUse => &self.webuse,
        }
    }

    /// Persist a new image and its web-use copy.
    pub fn ingest(
        &self,
        id: &str,
        chat_id: &str,
        message_id: &str,
        payload: impl Into<ImagePayload>,
        opts: IngestOptions,
    ) -> PipelineResult {
        if id.starts_with(OPTIMIZED_PREFIX) {
            let mut result = PipelineResult::new(id);
            result.original_id = id.to_string();
            return result.failed(format!(
                "image id {} uses the reserved {} prefix",
                id, OPTIMIZED_PREFIX
            ));
        }
        let result = PipelineResult::new(id);
        let (mut bytes, declared_mime) = match payload.into().into_bytes() {
            Ok(decoded) => decoded,
            Err(e) => return result.store_failed(&e),
        };
        let mut result = result;
        result.original_size = bytes.len() as u64;
        let mut extra = opts.extra.clone();

        let mut metadata = ImageMetadata::new(opts.source);
        metadata.extra = extra.clone();
        let meta = RecordMeta {
            mime_type: opts.mime_type.clone().or(declared_mime),
            metadata,
        };
        match self.original.put(id, chat_id, message_id, bytes.clone(), meta) {
            Ok(PutOutcome::Rejected { existing_size }) => {
                debug!("Original {} already stored ({} bytes)", id, existing_size);
                // The web-use copy follows the original that was kept
                match self.original.try_peek(id) {
                    Ok(Some(stored)) => {
                        result.original_size = stored.size_bytes;
                        extra = stored.metadata.extra;
                        bytes = stored.bytes;
                    }
                    Ok(None) => {}
                    Err(e) => return result.store_failed(&e),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Storing original {} failed: {}", id, e);
                return result.store_failed(&e);
            }
        }

        let preset = opts.preset.as_ref().unwrap_or(&self.default_preset);
        let result = self.store_optimized(&bytes, chat_id, message_id, extra, preset, result);
        if result.success {
            info!(
                "Ingested {} for chat {} ({} -> {} bytes, {:.1}% saved)",
                id, chat_id, result.original_size, result.optimized_size, result.savings_percent
            );
        }
        result
    }

    /// Rebuild the web-use copy of an existing original.
    pub fn reoptimize(&self, id: &str, preset: Option<&CompressionPreset>) -> PipelineResult {
        let result = PipelineResult::new(id);
        let original = match self.original.try_peek(original_id(id)) {
            Ok(Some(record)) => record,
            Ok(None) => return result.failed(format!("original image {} not found", id)),
            Err(e) => return result.store_failed(&e),
        };
        let mut result = result;
        result.original_size = original.size_bytes;
        let preset = preset.unwrap_or(&self.default_preset);
        self.store_optimized(
            &original.bytes,
            &original.chat_id,
            &original.message_id,
            original.metadata.extra.clone(),
            preset,
            result,
        )
    }

    fn store_optimized(
        &self,
        bytes: &[u8],
        chat_id: &str,
        message_id: &str,
        extra: Option<MetadataExtra>,
        preset: &CompressionPreset,
        mut result: PipelineResult,
    ) -> PipelineResult {
        let compressed = compress(bytes, preset);
        if let Some(reason) = &compressed.degraded {
            warn!("Optimizing {} failed, original kept: {}", result.original_id, reason);
            return result.failed(format!("compression failed: {}", reason));
        }

        let mut metadata =
            ImageMetadata::new(ImageSource::Compressed).with_compression(compressed.compression_info());
        metadata.extra = extra;
        let meta = RecordMeta::new(metadata).with_mime_type(compressed.mime_type.clone());
        let compressed_size = compressed.size_bytes;

        match self
            .webuse
            .put(&result.optimized_id, chat_id, message_id, compressed.bytes, meta)
        {
            Ok(outcome) => {
                result.optimized_size = match outcome {
                    PutOutcome::Rejected { existing_size } => existing_size,
                    _ => compressed_size,
                };
                result.savings_percent = savings_percent(result.original_size, result.optimized_size);
                result.success = true;
                result
            }
            Err(e) => {
                warn!("Storing optimized {} failed: {}", result.optimized_id, e);
                result.store_failed(&e)
            }
        }
    }

    /// Display copy only; a missing web-use record is not replaced by the original.
    pub fn get_for_display(&self, id: &str) -> Option<ImageRecord> {
        self.webuse.get(&optimized_id(id))
    }

    /// Full resolution copy for modal views and downloads.
    pub fn get_original_for_modal(&self, id: &str) -> Option<ImageRecord> {
        self.original.get(original_id(id))
    }

    /// Move both tiers' copies of an image to the recycle bin in one
    /// transaction. Returns how many records were moved.
    pub fn delete_image(&self, id: &str) -> StoreResult<usize> {
        let base = original_id(id);
        let keys = [
            (Tier::Original, base.to_string()),
            (Tier::WebUse, optimized_id(base)),
        ];
        let moved = self.recycle.move_from_tiers(&keys, DeletionReason::Other)?.len();
        if moved > 0 {
            info!("Deleted image {} ({} records recycled)", base, moved);
        }
        Ok(moved)
    }

    /// Put a recycled record back into the tier it came from. The bin entry is
    /// kept when the tier already holds a copy that is not larger.
    pub fn restore_image(&self, id: &str) -> StoreResult<Option<PutOutcome>> {
        let Some(entry) = self.recycle.get(id) else {
            return Ok(None);
        };
        self.recycle.restore(id, self.store_for(entry.tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::find_preset;
    use crate::test_support::{noisy_png, test_db};

    fn pipeline() -> Pipeline {
        let db = test_db();
        Pipeline::open(&db, RecycleBin::new(db.clone())).unwrap()
    }

    #[test]
    fn test_ingest_writes_both_tiers() {
        let pipeline = pipeline();
        let bytes = noisy_png(120, 90);
        let result = pipeline.ingest("img1", "chat", "msg", bytes.clone(), IngestOptions::default());

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.optimized_id, "opt_img1");
        assert_eq!(result.original_size, bytes.len() as u64);
        assert!(result.optimized_size < result.original_size);
        assert!(result.savings_percent > 0.0);

        let original = pipeline.get_original_for_modal("img1").unwrap();
        assert_eq!(original.bytes, bytes);
        assert_eq!(original.metadata.source, ImageSource::Generated);

        let display = pipeline.get_for_display("img1").unwrap();
        assert_eq!(display.mime_type, "image/webp");
        assert_eq!(display.metadata.source, ImageSource::Compressed);
        let info = display.metadata.compression.unwrap();
        assert_eq!(info.preset, DEFAULT_PRESET);
        assert_eq!(info.original_size, bytes.len() as u64);
    }

    #[test]
    fn test_optimized_id_is_deterministic() {
        let pipeline = pipeline();
        let first = pipeline.ingest("img1", "chat", "msg", noisy_png(40, 40), IngestOptions::default());
        let second = pipeline.ingest("img1", "chat", "msg", noisy_png(40, 40), IngestOptions::default());
        assert_eq!(first.optimized_id, "opt_img1");
        assert_eq!(second.optimized_id, "opt_img1");
        assert!(second.success);
        assert_eq!(pipeline.webuse().count().unwrap(), 1);
    }

    #[test]
    fn test_failed_compression_keeps_original() {
        let pipeline = pipeline();
        let garbage = b"not an image at all".to_vec();
        let result = pipeline.ingest("bad", "chat", "msg", garbage.clone(), IngestOptions::uploaded());

        assert!(!result.success);
        assert!(result.error.unwrap().contains("compression failed"));
        assert!(!result.storage_unavailable);
        assert_eq!(pipeline.get_original_for_modal("bad").unwrap().bytes, garbage);
        assert!(pipeline.get_for_display("bad").is_none());
    }

    #[test]
    fn test_display_does_not_fall_back_to_original() {
        let pipeline = pipeline();
        pipeline
            .original()
            .put("only", "chat", "msg", noisy_png(16, 16), RecordMeta::default())
            .unwrap();
        assert!(pipeline.get_for_display("only").is_none());
        assert!(pipeline.get_original_for_modal("only").is_some());
    }

    #[test]
    fn test_reoptimize_rebuilds_missing_copy() {
        let pipeline = pipeline();
        pipeline
            .original()
            .put("img", "chat", "msg", noisy_png(64, 64), RecordMeta::default())
            .unwrap();
        let preset = find_preset("webp-compact").unwrap();
        let result = pipeline.reoptimize("img", Some(&preset));
        assert!(result.success, "{:?}", result.error);
        let display = pipeline.get_for_display("img").unwrap();
        assert_eq!(display.metadata.compression.unwrap().preset, "webp-compact");

        let missing = pipeline.reoptimize("ghost", None);
        assert!(!missing.success);
    }

    #[test]
    fn test_ingest_with_unavailable_storage() {
        let db = Database::unavailable();
        let pipeline = Pipeline::open(&db, RecycleBin::new(db.clone())).unwrap();
        let result = pipeline.ingest("img", "chat", "msg", noisy_png(8, 8), IngestOptions::default());
        assert!(!result.success);
        assert!(result.storage_unavailable);
        assert!(pipeline.get_for_display("img").is_none());
    }

    #[test]
    fn test_delete_moves_both_tiers_to_recycle_bin() {
        let pipeline = pipeline();
        pipeline.ingest("img", "chat", "msg", noisy_png(32, 32), IngestOptions::default());

        assert_eq!(pipeline.delete_image("img").unwrap(), 2);
        assert!(pipeline.get_original_for_modal("img").is_none());
        assert!(pipeline.get_for_display("img").is_none());

        let recycled = pipeline.recycle_bin().list_all();
        assert_eq!(recycled.len(), 2);
        assert!(recycled
            .iter()
            .all(|e| e.deletion_reason == DeletionReason::Other));
        assert_eq!(pipeline.delete_image("img").unwrap(), 0);
    }

    #[test]
    fn test_restore_returns_record_to_its_tier() {
        let pipeline = pipeline();
        pipeline.ingest("img", "chat", "msg", noisy_png(32, 32), IngestOptions::default());
        pipeline.delete_image("img").unwrap();

        let outcome = pipeline.restore_image("opt_img").unwrap();
        assert_eq!(outcome, Some(PutOutcome::Inserted));
        assert!(pipeline.get_for_display("img").is_some());
        assert!(pipeline.recycle_bin().get("opt_img").is_none());
        assert!(pipeline.restore_image("never-deleted").unwrap().is_none());
    }

    #[test]
    fn test_generation_extra_is_carried_to_display_copy() {
        let pipeline = pipeline();
        let extra = MetadataExtra::Generation {
            provider: "ollama".to_string(),
            model: "sdxl".to_string(),
            prompt: "a lighthouse".to_string(),
            seed: Some(7),
        };
        let opts = IngestOptions::default().with_extra(extra.clone());
        pipeline.ingest("gen", "chat", "msg", noisy_png(24, 24), opts);
        assert_eq!(pipeline.get_for_display("gen").unwrap().metadata.extra, Some(extra));
    }

    #[test]
    fn test_ingest_rejects_reserved_prefix() {
        let pipeline = pipeline();
        let result = pipeline.ingest("opt_x", "chat", "msg", noisy_png(16, 16), IngestOptions::default());

        assert!(!result.success);
        assert_eq!(result.original_id, "opt_x");
        assert!(result.error.unwrap().contains("reserved"));
        assert_eq!(pipeline.original().count().unwrap(), 0);
        assert_eq!(pipeline.webuse().count().unwrap(), 0);
    }

    #[test]
    fn test_larger_reingest_compresses_the_kept_original() {
        let pipeline = pipeline();
        let small = noisy_png(40, 40);
        let large = noisy_png(80, 80);
        pipeline.ingest("img", "chat", "msg", small.clone(), IngestOptions::default());

        let result = pipeline.ingest("img", "chat", "msg", large, IngestOptions::default());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.original_size, small.len() as u64);
        assert_eq!(pipeline.get_original_for_modal("img").unwrap().bytes, small);
        let info = pipeline.get_for_display("img").unwrap().metadata.compression.unwrap();
        assert_eq!(info.original_size, small.len() as u64);
    }

    #[test]
    fn test_failed_delete_leaves_both_tiers_untouched() {
        let db = test_db();
        let pipeline = Pipeline::open(&db, RecycleBin::new(db.clone())).unwrap();
        pipeline.ingest("img", "chat", "msg", noisy_png(32, 32), IngestOptions::default());
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER keep_webuse BEFORE DELETE ON webuse_images \
                 BEGIN SELECT RAISE(ABORT, 'webuse is read-only'); END;",
            )?;
            Ok(())
        })
        .unwrap();

        assert!(pipeline.delete_image("img").is_err());
        assert!(pipeline.recycle_bin().list_all().is_empty());
        assert!(pipeline.get_original_for_modal("img").is_some());
        assert!(pipeline.get_for_display("img").is_some());
    }

    #[test]
    fn test_second_deletion_keeps_first_in_bin() {
        let pipeline = pipeline();
        let first = noisy_png(30, 30);
        pipeline.ingest("img", "chat", "m1", first.clone(), IngestOptions::default());
        pipeline.delete_image("img").unwrap();
        pipeline.ingest("img", "chat", "m2", noisy_png(36, 36), IngestOptions::default());
        pipeline.delete_image("img").unwrap();

        let originals: Vec<_> = pipeline
            .recycle_bin()
            .list_all()
            .into_iter()
            .filter(|e| e.tier == Tier::Original)
            .collect();
        assert_eq!(originals.len(), 2);
        assert_eq!(originals[0].record.message_id, "m2");
        assert_eq!(originals[1].record.message_id, "m1");
        assert_eq!(originals[1].record.bytes, first);
    }

    #[test]
    fn test_content_id_is_stable() {
        assert_eq!(content_id(b"abc"), content_id(b"abc"));
        assert_ne!(content_id(b"abc"), content_id(b"abd"));
        assert!(content_id(b"abc").starts_with("img_"));
        assert_eq!(content_id(b"abc").len(), 4 + 16);
    }
}

//! Keyed image store for one tier.
//!
//! Writers never coordinate. The only conflict policy is the monotonic-shrink
//! rule: a record is replaced only by a strictly smaller payload, so racing or
//! repeated writes for one id settle on the smallest copy.

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use super::records::{probe, ImageMetadata, ImagePayload, ImageRecord, ImageSource, RecordMeta, Tier};
use super::{sqlite, Database};
use crate::error::{StoreError, StoreResult};

/// What a `put` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// Replaced a larger record with the same id.
    Replaced,
    /// An existing record was not larger; nothing was written.
    Rejected { existing_size: u64 },
}

impl PutOutcome {
    pub fn is_written(&self) -> bool {
        !matches!(self, PutOutcome::Rejected { .. })
    }
}

/// Shrink-rule write of `record` into `tier`, for callers that already hold a
/// transaction. On replace the stored `created_at` is kept.
pub(crate) fn put_shrinking(
    conn: &Connection,
    tier: Tier,
    record: &mut ImageRecord,
) -> StoreResult<PutOutcome> {
    let outcome = match sqlite::select_size(conn, tier, &record.id)? {
        Some((existing_size, _)) if record.size_bytes >= existing_size => {
            PutOutcome::Rejected { existing_size }
        }
        Some((_, created_at)) => {
            record.created_at = created_at;
            record.last_accessed = Utc::now();
            sqlite::upsert_record(conn, tier, record)?;
            PutOutcome::Replaced
        }
        None => {
            sqlite::upsert_record(conn, tier, record)?;
            PutOutcome::Inserted
        }
    };
    Ok(outcome)
}

#[derive(Clone)]
pub struct ImageStore {
    db: Database,
    tier: Tier,
}

impl ImageStore {
    pub fn new(db: Database, tier: Tier) -> Self {
        Self { db, tier }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn is_available(&self) -> bool {
        self.db.is_available()
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    /// Store `payload` under `id`, applying the shrink rule against any existing record.
    pub fn put(
        &self,
        id: &str,
        chat_id: &str,
        message_id: &str,
        payload: impl Into<ImagePayload>,
        meta: RecordMeta,
    ) -> StoreResult<PutOutcome> {
        let (bytes, declared_mime) = payload.into().into_bytes()?;
        if bytes.is_empty() {
            return Err(StoreError::invalid_payload("image payload is empty"));
        }
        let mut meta = meta;
        if meta.mime_type.is_none() {
            meta.mime_type = declared_mime;
        }
        let record = ImageRecord::new(id, chat_id, message_id, bytes, meta);
        self.put_record(record)
    }

    /// Store a fully built record. Its timestamps are kept on insert, which
    /// lets maintenance moves carry records between tiers unchanged.
    pub fn put_record(&self, mut record: ImageRecord) -> StoreResult<PutOutcome> {
        record.size_bytes = record.bytes.len() as u64;
        let tier = self.tier;

        let outcome = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let outcome = put_shrinking(&tx, tier, &mut record)?;
            tx.commit()?;
            Ok(outcome)
        })?;

        match outcome {
            PutOutcome::Rejected { existing_size } => info!(
                "Kept existing {} image {} ({} bytes); new copy is {} bytes",
                tier, record.id, existing_size, record.size_bytes
            ),
            PutOutcome::Replaced => debug!(
                "Replaced {} image {} with smaller copy ({} bytes)",
                tier, record.id, record.size_bytes
            ),
            PutOutcome::Inserted => debug!(
                "Stored {} image {} ({} bytes)",
                tier, record.id, record.size_bytes
            ),
        }
        Ok(outcome)
    }

    /// Look up a record and mark it as accessed. Misses and storage failures
    /// both read as `None`.
    pub fn get(&self, id: &str) -> Option<ImageRecord> {
        match self.try_get(id) {
            Ok(found) => found,
            Err(e) => {
                log_read_failure(self.tier, "get", &e);
                None
            }
        }
    }

    pub fn try_get(&self, id: &str) -> StoreResult<Option<ImageRecord>> {
        let tier = self.tier;
        let now = Utc::now();
        let found = self.db.with_conn(|conn| match sqlite::select_record(conn, tier, id)? {
            Some(mut record) => {
                sqlite::touch_record(conn, tier, id, &now)?;
                record.last_accessed = now;
                Ok(Some(record))
            }
            None => Ok(None),
        })?;

        match found {
            Some(record) => Ok(Some(record)),
            None => Ok(self.migrate_legacy(id)),
        }
    }

    /// Read without refreshing `last_accessed`.
    pub fn peek(&self, id: &str) -> Option<ImageRecord> {
        match self.try_peek(id) {
            Ok(found) => found,
            Err(e) => {
                log_read_failure(self.tier, "peek", &e);
                None
            }
        }
    }

    pub fn try_peek(&self, id: &str) -> StoreResult<Option<ImageRecord>> {
        let tier = self.tier;
        self.db.with_conn(|conn| sqlite::select_record(conn, tier, id))
    }

    /// Remove a record. Returns false when nothing was deleted or storage is unavailable.
    pub fn delete(&self, id: &str) -> bool {
        match self.try_delete(id) {
            Ok(deleted) => deleted,
            Err(e) => {
                log_read_failure(self.tier, "delete", &e);
                false
            }
        }
    }

    pub fn try_delete(&self, id: &str) -> StoreResult<bool> {
        let tier = self.tier;
        let deleted = self.db.with_conn(|conn| sqlite::delete_record(conn, tier, id))?;
        if deleted {
            debug!("Deleted {} image {}", tier, id);
        }
        Ok(deleted)
    }

    pub fn list_by_chat(&self, chat_id: &str) -> Vec<ImageRecord> {
        let tier = self.tier;
        self.db
            .with_conn(|conn| sqlite::select_by_chat(conn, tier, chat_id))
            .unwrap_or_else(|e| {
                log_read_failure(tier, "list_by_chat", &e);
                Vec::new()
            })
    }

    pub fn list_all(&self) -> Vec<ImageRecord> {
        self.try_list_all().unwrap_or_else(|e| {
            log_read_failure(self.tier, "list_all", &e);
            Vec::new()
        })
    }

    pub fn try_list_all(&self) -> StoreResult<Vec<ImageRecord>> {
        let tier = self.tier;
        self.db.with_conn(|conn| sqlite::select_all(conn, tier))
    }

    pub fn count(&self) -> StoreResult<usize> {
        let tier = self.tier;
        self.db.with_conn(|conn| sqlite::count_records(conn, tier))
    }

    pub fn total_size(&self) -> StoreResult<u64> {
        let tier = self.tier;
        self.db.with_conn(|conn| sqlite::total_size(conn, tier))
    }

    /// Pull `id` out of the pre-split table into this tier, if it is there.
    /// Best effort: every failure is logged and reads as a miss.
    fn migrate_legacy(&self, id: &str) -> Option<ImageRecord> {
        let tier = self.tier;
        let migrated = self.db.with_conn(|conn| {
            let row = match sqlite::select_legacy(conn, tier, id) {
                Ok(Some(row)) => row,
                Ok(None) => return Ok(None),
                Err(e) => {
                    // Typically "no such table" on databases created after the split
                    debug!("No legacy {} lookup for {}: {}", tier, id, e);
                    return Ok(None);
                }
            };

            let tx = conn.transaction()?;
            if let Some(current) = sqlite::select_record(&tx, tier, id)? {
                sqlite::delete_legacy(&tx, tier, id)?;
                tx.commit()?;
                return Ok(Some(current));
            }

            let (sniffed_mime, width, height) = probe(&row.data);
            let now = Utc::now();
            let record = ImageRecord {
                id: row.id,
                chat_id: row.chat_id,
                message_id: row.message_id,
                size_bytes: row.data.len() as u64,
                bytes: row.data,
                mime_type: row.mime_type.unwrap_or(sniffed_mime),
                width,
                height,
                created_at: row.created_at.unwrap_or(now),
                last_accessed: now,
                metadata: ImageMetadata::new(ImageSource::Migrated),
            };
            sqlite::upsert_record(&tx, tier, &record)?;
            sqlite::delete_legacy(&tx, tier, id)?;
            tx.commit()?;
            Ok(Some(record))
        });

        match migrated {
            Ok(Some(record)) => {
                info!("Migrated legacy {} image {}", tier, id);
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Legacy migration of {} image {} failed: {}", tier, id, e);
                None
            }
        }
    }
}

fn log_read_failure(tier: Tier, op: &str, err: &StoreError) {
    if err.is_unavailable() {
        debug!("{} store {} skipped: storage unavailable", tier, op);
    } else {
        warn!("{} store {} failed: {}", tier, op, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ImageMetadata, LEGACY_SCHEMA};
    use crate::test_support::{png_bytes, test_db};

    fn store(tier: Tier) -> ImageStore {
        ImageStore::new(test_db(), tier)
    }

    fn meta() -> RecordMeta {
        RecordMeta::new(ImageMetadata::new(ImageSource::Uploaded))
    }

    #[test]
    fn test_put_then_get_returns_same_bytes() {
        let store = store(Tier::Original);
        let bytes = png_bytes(8, 6);
        let outcome = store.put("img1", "chat", "msg", bytes.clone(), meta()).unwrap();
        assert_eq!(outcome, PutOutcome::Inserted);

        let record = store.get("img1").unwrap();
        assert_eq!(record.bytes, bytes);
        assert_eq!(record.size_bytes, bytes.len() as u64);
        assert_eq!(record.mime_type, "image/png");
        assert_eq!((record.width, record.height), (8, 6));
        assert_eq!(record.metadata.source, ImageSource::Uploaded);
    }

    #[test]
    fn test_larger_or_equal_write_is_rejected() {
        let store = store(Tier::Original);
        store.put("a", "chat", "msg", vec![1u8; 100], meta()).unwrap();

        let equal = store.put("a", "chat", "msg", vec![2u8; 100], meta()).unwrap();
        assert_eq!(equal, PutOutcome::Rejected { existing_size: 100 });
        let larger = store.put("a", "chat", "msg", vec![3u8; 150], meta()).unwrap();
        assert!(!larger.is_written());

        assert_eq!(store.get("a").unwrap().bytes, vec![1u8; 100]);
    }

    #[test]
    fn test_smaller_write_replaces_and_keeps_created_at() {
        let store = store(Tier::WebUse);
        let mut first = ImageRecord::new("a", "chat", "msg", vec![1u8; 100], meta());
        first.created_at = Utc::now() - chrono::Duration::days(2);
        first.last_accessed = first.created_at;
        store.put_record(first.clone()).unwrap();

        let outcome = store.put("a", "chat", "msg", vec![9u8; 40], meta()).unwrap();
        assert_eq!(outcome, PutOutcome::Replaced);

        let record = store.peek("a").unwrap();
        assert_eq!(record.bytes, vec![9u8; 40]);
        assert_eq!(
            record.created_at.timestamp_millis(),
            first.created_at.timestamp_millis()
        );
        assert!(record.last_accessed > first.last_accessed);
    }

    #[test]
    fn test_get_refreshes_last_accessed_but_peek_does_not() {
        let store = store(Tier::Original);
        let mut record = ImageRecord::new("a", "chat", "msg", vec![1u8; 10], meta());
        record.last_accessed = Utc::now() - chrono::Duration::hours(5);
        store.put_record(record.clone()).unwrap();

        let peeked = store.peek("a").unwrap();
        assert_eq!(
            peeked.last_accessed.timestamp_millis(),
            record.last_accessed.timestamp_millis()
        );

        store.get("a").unwrap();
        assert!(store.peek("a").unwrap().last_accessed > record.last_accessed);
    }

    #[test]
    fn test_miss_is_none() {
        let store = store(Tier::Original);
        assert!(store.get("missing").is_none());
        assert!(!store.delete("missing"));
    }

    #[test]
    fn test_list_by_chat_and_delete() {
        let store = store(Tier::Original);
        store.put("a", "chat1", "m1", vec![1u8; 10], meta()).unwrap();
        store.put("b", "chat1", "m2", vec![1u8; 20], meta()).unwrap();
        store.put("c", "chat2", "m3", vec![1u8; 30], meta()).unwrap();

        let ids: Vec<_> = store.list_by_chat("chat1").into_iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()) && ids.contains(&"b".to_string()));
        assert_eq!(store.list_all().len(), 3);
        assert_eq!(store.total_size().unwrap(), 60);

        assert!(store.delete("a"));
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_tiers_are_independent() {
        let db = test_db();
        let original = ImageStore::new(db.clone(), Tier::Original);
        let webuse = ImageStore::new(db, Tier::WebUse);
        original.put("a", "chat", "msg", vec![1u8; 10], meta()).unwrap();
        assert!(webuse.get("a").is_none());
    }

    #[test]
    fn test_data_uri_payload_is_stored_as_bytes() {
        let store = store(Tier::Original);
        let payload = ImagePayload::DataUri("data:image/gif;base64,AQIDBA==".to_string());
        store.put("a", "chat", "msg", payload, meta()).unwrap();
        let record = store.get("a").unwrap();
        assert_eq!(record.bytes, vec![1, 2, 3, 4]);
        assert_eq!(record.mime_type, "image/gif");
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        let store = store(Tier::Original);
        let err = store.put("a", "chat", "msg", Vec::new(), meta()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload(_)));
    }

    #[test]
    fn test_unavailable_storage() {
        let store = ImageStore::new(Database::unavailable(), Tier::Original);
        assert!(store.get("a").is_none());
        assert!(store.list_all().is_empty());
        assert!(!store.delete("a"));
        let err = store.put("a", "chat", "msg", vec![1u8; 4], meta()).unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_legacy_record_is_migrated_on_miss() {
        let db = test_db();
        let bytes = png_bytes(4, 4);
        db.with_conn(|conn| {
            conn.execute_batch(LEGACY_SCHEMA)?;
            conn.execute(
                "INSERT INTO legacy_images (id, chat_id, message_id, data) VALUES (?, ?, ?, ?)",
                rusqlite::params!["old", "chat", "msg", bytes],
            )?;
            Ok(())
        })
        .unwrap();

        let store = ImageStore::new(db.clone(), Tier::Original);
        let record = store.get("old").unwrap();
        assert_eq!(record.bytes, bytes);
        assert_eq!(record.mime_type, "image/png");
        assert_eq!(record.metadata.source, ImageSource::Migrated);

        // Now served from the current table; the legacy row is gone
        assert!(store.peek("old").is_some());
        let legacy_rows: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM legacy_images", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(legacy_rows, 0);
    }

    #[test]
    fn test_missing_legacy_table_reads_as_miss() {
        let store = store(Tier::WebUse);
        assert!(store.get("opt_nothing").is_none());
    }
}

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::TrashConfig;
use crate::db::store::put_shrinking;
use crate::db::{
    sqlite, Database, DeletionReason, ImageRecord, ImageStore, PutOutcome, RecycledImage, Tier,
};
use crate::error::{StoreError, StoreResult};

/// Soft-delete store with a TTL sweep.
///
/// Owns the bytes of every record moved into it. [`move_from_tiers`] does the
/// tier delete in the same transaction; callers of `move_in` remove the
/// record from its tier only after it succeeded.
///
/// [`move_from_tiers`]: RecycleBin::move_from_tiers
#[derive(Clone)]
pub struct RecycleBin {
    db: Database,
    max_age_days: u32,
}

impl RecycleBin {
    pub fn new(db: Database) -> Self {
        Self::with_config(db, &TrashConfig::default())
    }

    pub fn with_config(db: Database, config: &TrashConfig) -> Self {
        Self {
            db,
            max_age_days: config.max_age_days,
        }
    }

    /// Record `record` as deleted from `tier`. Fails loudly when storage is
    /// unavailable, since a lost deletion would leak the bytes.
    pub fn move_in(&self, record: ImageRecord, tier: Tier, reason: DeletionReason) -> StoreResult<()> {
        let entry = RecycledImage::new(record, tier, reason);
        let entry_id = self.insert_entry(&entry)?;
        debug!(
            "Recycled {} image {} as entry {} ({})",
            tier,
            entry.id(),
            entry_id,
            reason.as_str()
        );
        Ok(())
    }

    /// All-or-nothing variant of [`move_in`](Self::move_in).
    pub fn move_in_batch(
        &self,
        records: Vec<(ImageRecord, Tier)>,
        reason: DeletionReason,
    ) -> StoreResult<usize> {
        let count = records.len();
        let now = Utc::now();
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            for (record, tier) in records {
                let entry = RecycledImage {
                    entry_id: None,
                    record,
                    tier,
                    deleted_at: now,
                    deletion_reason: reason,
                };
                sqlite::insert_recycled(&tx, &entry)?;
            }
            tx.commit()?;
            Ok(())
        })?;
        if count > 0 {
            info!("Recycled {} images ({})", count, reason.as_str());
        }
        Ok(count)
    }

    /// Take the stored records for `keys` out of their tiers and into the bin
    /// in one transaction. Either every record is moved or nothing changes.
    /// Keys with nothing stored are skipped.
    pub fn move_from_tiers(
        &self,
        keys: &[(Tier, String)],
        reason: DeletionReason,
    ) -> StoreResult<Vec<RecycledImage>> {
        let now = Utc::now();
        let moved = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut moved = Vec::with_capacity(keys.len());
            for (tier, id) in keys {
                let Some(record) = sqlite::select_record(&tx, *tier, id)? else {
                    continue;
                };
                let mut entry = RecycledImage {
                    entry_id: None,
                    record,
                    tier: *tier,
                    deleted_at: now,
                    deletion_reason: reason,
                };
                entry.entry_id = Some(sqlite::insert_recycled(&tx, &entry)?);
                sqlite::delete_record(&tx, *tier, id)?;
                moved.push(entry);
            }
            tx.commit()?;
            Ok(moved)
        })?;
        for entry in &moved {
            debug!(
                "Moved {} image {} to recycle bin ({})",
                entry.tier,
                entry.id(),
                reason.as_str()
            );
        }
        Ok(moved)
    }

    /// Single-record form of [`move_from_tiers`](Self::move_from_tiers).
    pub fn move_from_tier(
        &self,
        tier: Tier,
        id: &str,
        reason: DeletionReason,
    ) -> StoreResult<Option<RecycledImage>> {
        let mut moved = self.move_from_tiers(&[(tier, id.to_string())], reason)?;
        Ok(moved.pop())
    }

    /// Store a prepared entry as-is, keeping its `deleted_at`. Returns the
    /// new entry id.
    pub fn insert_entry(&self, entry: &RecycledImage) -> StoreResult<i64> {
        self.db.with_conn(|conn| sqlite::insert_recycled(conn, entry))
    }

    /// Most recent entry for `id`.
    pub fn get(&self, id: &str) -> Option<RecycledImage> {
        self.db
            .with_conn(|conn| sqlite::select_recycled(conn, id))
            .unwrap_or_else(|e| {
                warn!("Recycle bin lookup of {} failed: {}", id, e);
                None
            })
    }

    /// Newest deletions first.
    pub fn list_all(&self) -> Vec<RecycledImage> {
        self.db
            .with_conn(|conn| sqlite::select_all_recycled(conn))
            .unwrap_or_else(|e| {
                warn!("Recycle bin listing failed: {}", e);
                Vec::new()
            })
    }

    /// Permanently purge the most recent entry for `id`.
    pub fn delete(&self, id: &str) -> bool {
        match self.db.with_conn(|conn| sqlite::delete_recycled(conn, id)) {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("Purging {} from recycle bin failed: {}", id, e);
                false
            }
        }
    }

    pub fn delete_entry(&self, entry_id: i64) -> bool {
        match self.db.with_conn(|conn| sqlite::delete_recycled_entry(conn, entry_id)) {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("Purging bin entry {} failed: {}", entry_id, e);
                false
            }
        }
    }

    /// Put the most recent entry for `id` back into `store`, which must be
    /// the tier it was deleted from. The write and the removal from the bin
    /// share one transaction. The entry stays in the bin when the store keeps
    /// a copy that is not larger.
    pub fn restore(&self, id: &str, store: &ImageStore) -> StoreResult<Option<PutOutcome>> {
        let tier = store.tier();
        let outcome = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(entry) = sqlite::select_recycled(&tx, id)? else {
                return Ok(None);
            };
            if entry.tier != tier {
                return Err(StoreError::invalid_payload(format!(
                    "{} was deleted from {}, not {}",
                    id, entry.tier, tier
                )));
            }
            let mut record = entry.record;
            record.size_bytes = record.bytes.len() as u64;
            let outcome = put_shrinking(&tx, tier, &mut record)?;
            if outcome.is_written() {
                if let Some(entry_id) = entry.entry_id {
                    sqlite::delete_recycled_entry(&tx, entry_id)?;
                }
            }
            tx.commit()?;
            Ok(Some(outcome))
        })?;
        match outcome {
            Some(outcome) if outcome.is_written() => info!("Restored {} image {}", tier, id),
            Some(PutOutcome::Rejected { existing_size }) => debug!(
                "Kept {} in recycle bin; {} holds a {} byte copy",
                id, tier, existing_size
            ),
            _ => {}
        }
        Ok(outcome)
    }

    pub fn clear_all(&self) -> StoreResult<usize> {
        let purged = self.db.with_conn(|conn| sqlite::clear_recycled(conn))?;
        info!("Emptied recycle bin ({} images)", purged);
        Ok(purged)
    }

    /// Purge entries deleted more than `days` ago. Safe to run repeatedly.
    pub fn cleanup_older_than(&self, days: u32) -> StoreResult<usize> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let purged = self
            .db
            .with_conn(|conn| sqlite::delete_recycled_before(conn, &cutoff))?;
        if purged > 0 {
            info!("Purged {} recycled images older than {} days", purged, days);
        }
        Ok(purged)
    }

    /// Sweep with the configured maximum age.
    pub fn cleanup_expired(&self) -> StoreResult<usize> {
        self.cleanup_older_than(self.max_age_days)
    }

    pub fn total_size(&self) -> StoreResult<u64> {
        self.db.with_conn(|conn| sqlite::recycled_total_size(conn))
    }

    pub fn max_age_days(&self) -> u32 {
        self.max_age_days
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ImageMetadata, ImageSource, RecordMeta};
    use crate::test_support::test_db;

    fn record(id: &str, size: usize) -> ImageRecord {
        ImageRecord::new(
            id,
            "chat",
            "msg",
            vec![7u8; size],
            RecordMeta::new(ImageMetadata::new(ImageSource::Generated)),
        )
    }

    fn aged(id: &str, days: i64) -> RecycledImage {
        RecycledImage {
            deleted_at: Utc::now() - Duration::days(days),
            ..RecycledImage::new(record(id, 10), Tier::Original, DeletionReason::Other)
        }
    }

    #[test]
    fn test_move_in_and_get() {
        let bin = RecycleBin::new(test_db());
        bin.move_in(record("a", 12), Tier::WebUse, DeletionReason::Dedupe).unwrap();

        let entry = bin.get("a").unwrap();
        assert_eq!(entry.tier, Tier::WebUse);
        assert_eq!(entry.deletion_reason, DeletionReason::Dedupe);
        assert_eq!(entry.record.bytes, vec![7u8; 12]);
        assert_eq!(bin.total_size().unwrap(), 12);
    }

    #[test]
    fn test_sweep_purges_only_expired() {
        let bin = RecycleBin::new(test_db());
        bin.insert_entry(&aged("old", 31)).unwrap();
        bin.insert_entry(&aged("recent", 29)).unwrap();

        assert_eq!(bin.cleanup_older_than(30).unwrap(), 1);
        assert!(bin.get("old").is_none());
        assert!(bin.get("recent").is_some());

        // Idempotent
        assert_eq!(bin.cleanup_older_than(30).unwrap(), 0);
    }

    #[test]
    fn test_cleanup_expired_uses_configured_age() {
        let config = TrashConfig {
            max_age_days: 7,
            ..TrashConfig::default()
        };
        let bin = RecycleBin::with_config(test_db(), &config);
        bin.insert_entry(&aged("week_old", 8)).unwrap();
        bin.insert_entry(&aged("fresh", 1)).unwrap();
        assert_eq!(bin.cleanup_expired().unwrap(), 1);
        assert_eq!(bin.max_age_days(), 7);
    }

    #[test]
    fn test_list_all_is_newest_first() {
        let bin = RecycleBin::new(test_db());
        bin.insert_entry(&aged("oldest", 10)).unwrap();
        bin.insert_entry(&aged("newest", 1)).unwrap();
        bin.insert_entry(&aged("middle", 5)).unwrap();

        let ids: Vec<_> = bin.list_all().iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["newest", "middle", "oldest"]);
    }

    #[test]
    fn test_batch_delete_and_clear() {
        let bin = RecycleBin::new(test_db());
        let moved = bin
            .move_in_batch(
                vec![
                    (record("a", 1), Tier::Original),
                    (record("b", 2), Tier::WebUse),
                    (record("c", 3), Tier::Original),
                ],
                DeletionReason::Unreferenced,
            )
            .unwrap();
        assert_eq!(moved, 3);

        assert!(bin.delete("a"));
        assert!(!bin.delete("a"));
        assert_eq!(bin.clear_all().unwrap(), 2);
        assert!(bin.list_all().is_empty());
    }

    #[test]
    fn test_restore_honors_tier_and_shrink_rule() {
        let db = test_db();
        let bin = RecycleBin::new(db.clone());
        let webuse = ImageStore::new(db.clone(), Tier::WebUse);
        let original = ImageStore::new(db, Tier::Original);

        bin.move_in(record("opt_x", 50), Tier::WebUse, DeletionReason::Other).unwrap();
        assert!(bin.restore("opt_x", &original).is_err());

        // A smaller copy already took its place
        webuse.put_record(record("opt_x", 20)).unwrap();
        let outcome = bin.restore("opt_x", &webuse).unwrap();
        assert_eq!(outcome, Some(PutOutcome::Rejected { existing_size: 20 }));
        assert!(bin.get("opt_x").is_some());

        webuse.delete("opt_x");
        assert_eq!(bin.restore("opt_x", &webuse).unwrap(), Some(PutOutcome::Inserted));
        assert!(bin.get("opt_x").is_none());
        assert_eq!(webuse.peek("opt_x").unwrap().size_bytes, 50);
        assert_eq!(bin.restore("opt_x", &webuse).unwrap(), None);
    }

    #[test]
    fn test_deleting_the_same_id_twice_keeps_both_entries() {
        let bin = RecycleBin::new(test_db());
        bin.move_in(record("img", 10), Tier::Original, DeletionReason::Other).unwrap();
        bin.move_in(record("img", 20), Tier::Original, DeletionReason::Other).unwrap();

        let entries = bin.list_all();
        assert_eq!(entries.len(), 2);
        assert_ne!(entries[0].entry_id, entries[1].entry_id);
        assert_eq!(bin.total_size().unwrap(), 30);

        // Lookups and purges act on the latest deletion
        assert_eq!(bin.get("img").unwrap().record.size_bytes, 20);
        assert!(bin.delete("img"));
        assert_eq!(bin.get("img").unwrap().record.size_bytes, 10);
    }

    #[test]
    fn test_batch_keeps_same_id_from_both_tiers() {
        let bin = RecycleBin::new(test_db());
        bin.move_in_batch(
            vec![(record("x", 1), Tier::Original), (record("x", 2), Tier::WebUse)],
            DeletionReason::Dedupe,
        )
        .unwrap();

        let mut tiers: Vec<_> = bin.list_all().iter().map(|e| (e.tier, e.record.size_bytes)).collect();
        tiers.sort_by_key(|(_, size)| *size);
        assert_eq!(tiers, vec![(Tier::Original, 1), (Tier::WebUse, 2)]);
    }

    #[test]
    fn test_delete_entry_targets_one_deletion() {
        let bin = RecycleBin::new(test_db());
        bin.move_in(record("img", 10), Tier::Original, DeletionReason::Other).unwrap();
        bin.move_in(record("img", 20), Tier::Original, DeletionReason::Other).unwrap();
        let older = bin.list_all()[1].entry_id.unwrap();

        assert!(bin.delete_entry(older));
        assert!(!bin.delete_entry(older));
        let left = bin.list_all();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].record.size_bytes, 20);
    }

    #[test]
    fn test_move_from_tiers_takes_records_out_of_their_tier() {
        let db = test_db();
        let bin = RecycleBin::new(db.clone());
        let original = ImageStore::new(db.clone(), Tier::Original);
        let webuse = ImageStore::new(db, Tier::WebUse);
        original.put_record(record("a", 30)).unwrap();
        webuse.put_record(record("opt_a", 10)).unwrap();

        let moved = bin
            .move_from_tiers(
                &[
                    (Tier::Original, "a".to_string()),
                    (Tier::WebUse, "opt_a".to_string()),
                    (Tier::WebUse, "missing".to_string()),
                ],
                DeletionReason::Other,
            )
            .unwrap();

        assert_eq!(moved.len(), 2);
        assert!(moved.iter().all(|e| e.entry_id.is_some()));
        assert!(original.peek("a").is_none());
        assert!(webuse.peek("opt_a").is_none());
        assert_eq!(bin.list_all().len(), 2);
        assert_eq!(bin.move_from_tier(Tier::Original, "a", DeletionReason::Other).unwrap(), None);
    }

    #[test]
    fn test_move_from_tier_rolls_back_when_the_tier_delete_fails() {
        let db = test_db();
        let bin = RecycleBin::new(db.clone());
        let original = ImageStore::new(db.clone(), Tier::Original);
        original.put_record(record("a", 30)).unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER keep_originals BEFORE DELETE ON original_images \
                 BEGIN SELECT RAISE(ABORT, 'originals are read-only'); END;",
            )?;
            Ok(())
        })
        .unwrap();

        assert!(bin.move_from_tier(Tier::Original, "a", DeletionReason::Other).is_err());
        assert!(bin.list_all().is_empty());
        assert_eq!(original.peek("a").unwrap().size_bytes, 30);
    }

    #[test]
    fn test_restore_picks_latest_deletion() {
        let db = test_db();
        let bin = RecycleBin::new(db.clone());
        let original = ImageStore::new(db, Tier::Original);
        bin.move_in(record("img", 40), Tier::Original, DeletionReason::Other).unwrap();
        bin.move_in(record("img", 25), Tier::Original, DeletionReason::Other).unwrap();

        assert_eq!(bin.restore("img", &original).unwrap(), Some(PutOutcome::Inserted));
        assert_eq!(original.peek("img").unwrap().size_bytes, 25);
        let left = bin.list_all();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].record.size_bytes, 40);
    }

    #[test]
    fn test_move_in_reports_unavailable_storage() {
        let bin = RecycleBin::new(Database::unavailable());
        let err = bin
            .move_in(record("a", 1), Tier::Original, DeletionReason::Other)
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(bin.list_all().is_empty());
    }
}

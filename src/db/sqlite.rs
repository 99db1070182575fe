//! SQLite statements for the image tiers and the recycle bin.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::records::{ImageMetadata, ImageRecord, Tier};
use super::trash::{DeletionReason, RecycledImage};
use super::{format_timestamp, parse_timestamp};
use crate::error::StoreResult;

const RECORD_COLUMNS: &str = "id, chat_id, message_id, data, mime_type, width, height, \
                              size_bytes, created_at, last_accessed, metadata";

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

#[derive(Debug, thiserror::Error)]
#[error("invalid stored value: {0}")]
struct InvalidValue(String);

fn timestamp_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, InvalidValue(raw)))
}

/// Map a row selected with [`RECORD_COLUMNS`] (in that order, starting at `offset`).
fn record_from_row(row: &Row, offset: usize) -> rusqlite::Result<ImageRecord> {
    let metadata_json: String = row.get(offset + 10)?;
    let metadata: ImageMetadata =
        serde_json::from_str(&metadata_json).map_err(|e| conversion_error(offset + 10, e))?;
    Ok(ImageRecord {
        id: row.get(offset)?,
        chat_id: row.get(offset + 1)?,
        message_id: row.get(offset + 2)?,
        bytes: row.get(offset + 3)?,
        mime_type: row.get(offset + 4)?,
        width: row.get(offset + 5)?,
        height: row.get(offset + 6)?,
        size_bytes: row.get::<_, i64>(offset + 7)? as u64,
        created_at: timestamp_at(row, offset + 8)?,
        last_accessed: timestamp_at(row, offset + 9)?,
        metadata,
    })
}

// ============================================================================
// Tier tables
// ============================================================================

pub fn select_record(conn: &Connection, tier: Tier, id: &str) -> StoreResult<Option<ImageRecord>> {
    let sql = format!("SELECT {} FROM {} WHERE id = ?", RECORD_COLUMNS, tier.table());
    let record = conn
        .query_row(&sql, [id], |row| record_from_row(row, 0))
        .optional()?;
    Ok(record)
}

/// Size of the stored record, without loading its bytes.
pub fn select_size(conn: &Connection, tier: Tier, id: &str) -> StoreResult<Option<(u64, DateTime<Utc>)>> {
    let sql = format!("SELECT size_bytes, created_at FROM {} WHERE id = ?", tier.table());
    let found = conn
        .query_row(&sql, [id], |row| {
            Ok((row.get::<_, i64>(0)? as u64, timestamp_at(row, 1)?))
        })
        .optional()?;
    Ok(found)
}

pub fn select_by_chat(conn: &Connection, tier: Tier, chat_id: &str) -> StoreResult<Vec<ImageRecord>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE chat_id = ? ORDER BY created_at, id",
        RECORD_COLUMNS,
        tier.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map([chat_id], |row| record_from_row(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

pub fn select_all(conn: &Connection, tier: Tier) -> StoreResult<Vec<ImageRecord>> {
    let sql = format!(
        "SELECT {} FROM {} ORDER BY chat_id, created_at, id",
        RECORD_COLUMNS,
        tier.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map([], |row| record_from_row(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

pub fn upsert_record(conn: &Connection, tier: Tier, record: &ImageRecord) -> StoreResult<()> {
    let sql = format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        tier.table(),
        RECORD_COLUMNS
    );
    let metadata = serde_json::to_string(&record.metadata)?;
    conn.execute(
        &sql,
        params![
            record.id,
            record.chat_id,
            record.message_id,
            record.bytes,
            record.mime_type,
            record.width,
            record.height,
            record.size_bytes as i64,
            format_timestamp(&record.created_at),
            format_timestamp(&record.last_accessed),
            metadata,
        ],
    )?;
    Ok(())
}

pub fn touch_record(conn: &Connection, tier: Tier, id: &str, at: &DateTime<Utc>) -> StoreResult<()> {
    let sql = format!("UPDATE {} SET last_accessed = ? WHERE id = ?", tier.table());
    conn.execute(&sql, params![format_timestamp(at), id])?;
    Ok(())
}

pub fn delete_record(conn: &Connection, tier: Tier, id: &str) -> StoreResult<bool> {
    let sql = format!("DELETE FROM {} WHERE id = ?", tier.table());
    let deleted = conn.execute(&sql, [id])?;
    Ok(deleted > 0)
}

pub fn count_records(conn: &Connection, tier: Tier) -> StoreResult<usize> {
    let sql = format!("SELECT COUNT(*) FROM {}", tier.table());
    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(count as usize)
}

pub fn total_size(conn: &Connection, tier: Tier) -> StoreResult<u64> {
    let sql = format!("SELECT COALESCE(SUM(size_bytes), 0) FROM {}", tier.table());
    let size: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(size as u64)
}

// ============================================================================
// Legacy tables
// ============================================================================

/// Row shape of the pre-split tables.
#[derive(Debug, Clone)]
pub struct LegacyRow {
    pub id: String,
    pub chat_id: String,
    pub message_id: String,
    pub data: Vec<u8>,
    pub mime_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Fails when the legacy table does not exist; callers treat that as a miss.
pub fn select_legacy(conn: &Connection, tier: Tier, id: &str) -> rusqlite::Result<Option<LegacyRow>> {
    let sql = format!(
        "SELECT id, chat_id, message_id, data, mime_type, created_at FROM {} WHERE id = ?",
        tier.legacy_table()
    );
    conn.query_row(&sql, [id], |row| {
        Ok(LegacyRow {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            message_id: row.get(2)?,
            data: row.get(3)?,
            mime_type: row.get(4)?,
            created_at: row
                .get::<_, Option<String>>(5)?
                .as_deref()
                .and_then(parse_timestamp),
        })
    })
    .optional()
}

pub fn delete_legacy(conn: &Connection, tier: Tier, id: &str) -> rusqlite::Result<usize> {
    let sql = format!("DELETE FROM {} WHERE id = ?", tier.legacy_table());
    conn.execute(&sql, [id])
}

// ============================================================================
// Recycle bin
// ============================================================================

const RECYCLED_COLUMNS: &str = "id, chat_id, message_id, data, mime_type, width, height, \
                                size_bytes, created_at, last_accessed, metadata, \
                                tier, deleted_at, deletion_reason";

/// Newest entry first; `entry_id` breaks ties within one millisecond.
const RECYCLED_ORDER: &str = "ORDER BY deleted_at DESC, entry_id DESC";

/// Map a row selected as `RECYCLED_COLUMNS, entry_id`.
fn recycled_from_row(row: &Row) -> rusqlite::Result<RecycledImage> {
    let record = record_from_row(row, 0)?;
    let tier_raw: String = row.get(11)?;
    let tier = Tier::parse(&tier_raw).ok_or_else(|| conversion_error(11, InvalidValue(tier_raw)))?;
    let reason_raw: String = row.get(13)?;
    let deletion_reason = DeletionReason::parse(&reason_raw)
        .ok_or_else(|| conversion_error(13, InvalidValue(reason_raw)))?;
    Ok(RecycledImage {
        entry_id: Some(row.get(14)?),
        record,
        tier,
        deleted_at: timestamp_at(row, 12)?,
        deletion_reason,
    })
}

/// Append an entry and return its `entry_id`. Earlier entries for the same
/// id are kept.
pub fn insert_recycled(conn: &Connection, entry: &RecycledImage) -> StoreResult<i64> {
    let sql = format!(
        "INSERT INTO recycle_bin ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        RECYCLED_COLUMNS
    );
    let record = &entry.record;
    let metadata = serde_json::to_string(&record.metadata)?;
    conn.execute(
        &sql,
        params![
            record.id,
            record.chat_id,
            record.message_id,
            record.bytes,
            record.mime_type,
            record.width,
            record.height,
            record.size_bytes as i64,
            format_timestamp(&record.created_at),
            format_timestamp(&record.last_accessed),
            metadata,
            entry.tier.as_str(),
            format_timestamp(&entry.deleted_at),
            entry.deletion_reason.as_str(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent entry for `id`.
pub fn select_recycled(conn: &Connection, id: &str) -> StoreResult<Option<RecycledImage>> {
    let sql = format!(
        "SELECT {}, entry_id FROM recycle_bin WHERE id = ? {} LIMIT 1",
        RECYCLED_COLUMNS, RECYCLED_ORDER
    );
    let entry = conn.query_row(&sql, [id], recycled_from_row).optional()?;
    Ok(entry)
}

pub fn select_all_recycled(conn: &Connection) -> StoreResult<Vec<RecycledImage>> {
    let sql = format!(
        "SELECT {}, entry_id FROM recycle_bin {}",
        RECYCLED_COLUMNS, RECYCLED_ORDER
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map([], recycled_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Remove the most recent entry for `id`.
pub fn delete_recycled(conn: &Connection, id: &str) -> StoreResult<bool> {
    let sql = format!(
        "DELETE FROM recycle_bin WHERE entry_id = \
         (SELECT entry_id FROM recycle_bin WHERE id = ? {} LIMIT 1)",
        RECYCLED_ORDER
    );
    let deleted = conn.execute(&sql, [id])?;
    Ok(deleted > 0)
}

pub fn delete_recycled_entry(conn: &Connection, entry_id: i64) -> StoreResult<bool> {
    let deleted = conn.execute("DELETE FROM recycle_bin WHERE entry_id = ?", [entry_id])?;
    Ok(deleted > 0)
}

pub fn clear_recycled(conn: &Connection) -> StoreResult<usize> {
    let deleted = conn.execute("DELETE FROM recycle_bin", [])?;
    Ok(deleted)
}

pub fn delete_recycled_before(conn: &Connection, cutoff: &DateTime<Utc>) -> StoreResult<usize> {
    let deleted = conn.execute(
        "DELETE FROM recycle_bin WHERE deleted_at < ?",
        [format_timestamp(cutoff)],
    )?;
    Ok(deleted)
}

pub fn recycled_total_size(conn: &Connection) -> StoreResult<u64> {
    let size: i64 = conn.query_row(
        "SELECT COALESCE(SUM(size_bytes), 0) FROM recycle_bin",
        [],
        |row| row.get(0),
    )?;
    Ok(size as u64)
}

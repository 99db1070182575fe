mod schema;
pub mod records;
pub mod settings;
pub mod sqlite;
pub mod store;
pub mod trash;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

pub use records::{
    optimized_id, original_id, CompressionInfo, ImageMetadata, ImagePayload, ImageRecord,
    ImageSource, MetadataExtra, RecordMeta, Tier, OPTIMIZED_PREFIX,
};
pub use schema::{LEGACY_SCHEMA, MIGRATIONS, SCHEMA};
pub use settings::{PresetSelection, SettingsStore};
pub use store::{ImageStore, PutOutcome};
pub use trash::{DeletionReason, RecycledImage};

use crate::error::{StoreError, StoreResult};

/// Shared handle to the SQLite file holding every tier, the recycle bin and
/// the settings row.
///
/// Cloning is cheap; all clones use the same connection. Each store call
/// holds the lock for exactly one statement or transaction, which keeps
/// operations atomic per record. A handle built with [`Database::unavailable`]
/// stands in for a missing backend: reads come back empty and writes fail with
/// [`StoreError::Unavailable`].
#[derive(Clone)]
pub struct Database {
    conn: Option<Arc<Mutex<Connection>>>,
}

impl Database {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!("Cannot create database directory {:?}: {}", parent, e);
                return Err(StoreError::Unavailable);
            }
        }
        let conn = Connection::open(path).map_err(|e| {
            error!("Cannot open image database at {:?}: {}", path, e);
            StoreError::Unavailable
        })?;
        debug!("Opened image database at {:?}", path);
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            error!("Cannot open in-memory database: {}", e);
            StoreError::Unavailable
        })?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Some(Arc::new(Mutex::new(conn))),
        }
    }

    /// A handle with no backend behind it.
    pub fn unavailable() -> Self {
        Self { conn: None }
    }

    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    pub fn initialize(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            for migration in MIGRATIONS {
                let _ = conn.execute(migration, []);
            }
            Ok(())
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let Some(conn) = &self.conn else {
            return Err(StoreError::Unavailable);
        };
        let mut guard = conn.lock().map_err(|_| {
            warn!("Image database lock is poisoned");
            StoreError::Unavailable
        })?;
        f(&mut guard)
    }
}

/// Timestamps are stored as fixed-width RFC 3339 strings so that SQL string
/// comparison matches chronological order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

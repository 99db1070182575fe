pub const SCHEMA: &str = r#"
-- Full fidelity tier
CREATE TABLE IF NOT EXISTS original_images (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    data BLOB NOT NULL,
    mime_type TEXT NOT NULL,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    size_bytes INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    metadata TEXT NOT NULL  -- JSON ImageMetadata
);

CREATE INDEX IF NOT EXISTS idx_original_images_chat ON original_images(chat_id);

-- Compressed display tier, ids are "opt_" + original id
CREATE TABLE IF NOT EXISTS webuse_images (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    data BLOB NOT NULL,
    mime_type TEXT NOT NULL,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    size_bytes INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    metadata TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_webuse_images_chat ON webuse_images(chat_id);

-- Soft-deleted records from either tier. One id may be deleted more than
-- once, so entries are keyed by entry_id.
CREATE TABLE IF NOT EXISTS recycle_bin (
    entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    tier TEXT NOT NULL,             -- 'original' or 'webuse'
    chat_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    data BLOB NOT NULL,
    mime_type TEXT NOT NULL,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    size_bytes INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    metadata TEXT NOT NULL,
    deleted_at TEXT NOT NULL,       -- RFC 3339, millisecond precision, UTC
    deletion_reason TEXT NOT NULL   -- 'dedupe', 'unreferenced', 'other'
);

CREATE INDEX IF NOT EXISTS idx_recycle_bin_deleted_at ON recycle_bin(deleted_at);
CREATE INDEX IF NOT EXISTS idx_recycle_bin_id ON recycle_bin(id);

-- Single-row settings table
CREATE TABLE IF NOT EXISTS settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    selection TEXT NOT NULL,        -- JSON PresetSelection
    updated_at TEXT NOT NULL
);
"#;

/// Layout of the single-table store that predates the tier split. Never created
/// by [`SCHEMA`]; only read when an old database still carries it.
pub const LEGACY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS legacy_images (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    data BLOB NOT NULL,
    mime_type TEXT,
    created_at TEXT
);

CREATE TABLE IF NOT EXISTS legacy_optimized_images (
    id TEXT PRIMARY KEY,
    chat_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    data BLOB NOT NULL,
    mime_type TEXT,
    created_at TEXT
);
"#;

/// Additive migrations; each may fail harmlessly when already applied.
pub const MIGRATIONS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_original_images_message ON original_images(message_id)",
    "CREATE INDEX IF NOT EXISTS idx_webuse_images_message ON webuse_images(message_id)",
];

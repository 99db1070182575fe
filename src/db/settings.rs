//! Persisted compression preset selection.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{format_timestamp, Database};
use crate::compress::{resolve_preset, CompressionPreset, CustomPreset, DEFAULT_PRESET};
use crate::error::{PresetError, StoreResult};

pub const SETTINGS_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetSelection {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_preset_name")]
    pub preset: String,
    #[serde(default)]
    pub custom: Option<CustomPreset>,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_preset_name() -> String {
    DEFAULT_PRESET.to_string()
}

impl Default for PresetSelection {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            preset: default_preset_name(),
            custom: None,
        }
    }
}

impl PresetSelection {
    pub fn named(preset: impl Into<String>) -> Self {
        Self {
            preset: preset.into(),
            ..Self::default()
        }
    }

    pub fn resolve(&self) -> Result<CompressionPreset, PresetError> {
        resolve_preset(&self.preset, self.custom.as_ref())
    }
}

pub struct SettingsStore {
    db: Database,
}

impl SettingsStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Current selection; defaults when nothing was saved or the row is unreadable.
    pub fn load(&self) -> PresetSelection {
        self.saved().unwrap_or_default()
    }

    /// The stored selection, if there is a readable one.
    pub fn saved(&self) -> Option<PresetSelection> {
        let row = self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT version, selection FROM settings WHERE id = 1",
                    [],
                    |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            Ok(row)
        });

        match row {
            Ok(Some((version, json))) if version <= SETTINGS_VERSION => {
                match serde_json::from_str(&json) {
                    Ok(selection) => Some(selection),
                    Err(e) => {
                        warn!("Unreadable settings row, using defaults: {}", e);
                        None
                    }
                }
            }
            Ok(Some((version, _))) => {
                warn!(
                    "Settings version {} is newer than supported {}, using defaults",
                    version, SETTINGS_VERSION
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Cannot read settings, using defaults: {}", e);
                None
            }
        }
    }

    pub fn save(&self, selection: &PresetSelection) -> StoreResult<()> {
        let json = serde_json::to_string(selection)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (id, version, selection, updated_at) VALUES (1, ?, ?, ?)",
                params![SETTINGS_VERSION, json, format_timestamp(&Utc::now())],
            )?;
            Ok(())
        })
    }

    /// The active preset, falling back to the default when the saved one no longer resolves.
    pub fn active_preset(&self) -> CompressionPreset {
        let selection = self.load();
        match selection.resolve() {
            Ok(preset) => preset,
            Err(e) => {
                warn!("Saved preset {:?} is invalid ({}), using {}", selection.preset, e, DEFAULT_PRESET);
                PresetSelection::default()
                    .resolve()
                    .unwrap_or_else(|_| crate::compress::presets()[0].clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;

    #[test]
    fn test_defaults_when_empty() {
        let settings = SettingsStore::new(test_db());
        assert_eq!(settings.load(), PresetSelection::default());
        assert!(settings.saved().is_none());
        assert_eq!(settings.active_preset().name, DEFAULT_PRESET);
    }

    #[test]
    fn test_save_and_load_custom() {
        let settings = SettingsStore::new(test_db());
        let selection = PresetSelection {
            preset: "custom".to_string(),
            custom: Some(CustomPreset {
                quality: 0.42,
                ..CustomPreset::default()
            }),
            ..PresetSelection::default()
        };
        settings.save(&selection).unwrap();
        assert_eq!(settings.load(), selection);
        assert_eq!(settings.active_preset().quality, 0.42);
    }

    #[test]
    fn test_invalid_saved_preset_falls_back() {
        let settings = SettingsStore::new(test_db());
        settings.save(&PresetSelection::named("retired-preset")).unwrap();
        assert_eq!(settings.active_preset().name, DEFAULT_PRESET);
    }

    #[test]
    fn test_newer_version_is_ignored() {
        let db = test_db();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (id, version, selection, updated_at) VALUES (1, 99, '{}', 'x')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        assert_eq!(SettingsStore::new(db).load(), PresetSelection::default());
    }

    #[test]
    fn test_unavailable_storage_uses_defaults() {
        let settings = SettingsStore::new(Database::unavailable());
        assert_eq!(settings.load(), PresetSelection::default());
        assert!(settings.save(&PresetSelection::default()).is_err());
    }
}

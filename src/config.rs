use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::compress::DEFAULT_PRESET;
use crate::logging::LoggingConfig;
use crate::tasks::{MAX_CONCURRENCY, MIN_CONCURRENCY};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub trash: TrashConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Preset used when the settings table has no selection yet.
    #[serde(default = "default_preset")]
    pub default_preset: String,
}

fn default_preset() -> String {
    DEFAULT_PRESET.to_string()
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default_preset: default_preset(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashConfig {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    /// Run the TTL sweep every time the binary starts.
    #[serde(default = "default_sweep_on_start")]
    pub sweep_on_start: bool,
}

fn default_max_age_days() -> u32 {
    30
}

fn default_sweep_on_start() -> bool {
    true
}

impl Default for TrashConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            sweep_on_start: default_sweep_on_start(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    3
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

impl BatchConfig {
    /// Configured concurrency forced into the accepted range.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("picvault")
        .join("images.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            compression: CompressionConfig::default(),
            trash: TrashConfig::default(),
            batch: BatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load from `PICVAULT_CONFIG` or the default location, writing defaults
    /// on first run.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("picvault")
    }

    fn config_path() -> PathBuf {
        match std::env::var_os("PICVAULT_CONFIG") {
            Some(path) => PathBuf::from(path),
            None => Self::config_dir().join("config.toml"),
        }
    }
}

//! Tracing setup for the CLI and library callers.
//!
//! Backend is chosen by [`LoggingConfig::backend`]: journald, a daily rolling
//! file, or `auto` (journald when reachable on Linux, the file otherwise).

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the tracing filter. Wins over the config.
pub const LOG_ENV: &str = "PICVAULT_LOG";

/// Log file name prefix inside the log directory.
const LOG_FILE: &str = "picvault.log";

const DEFAULT_LEVEL: &str = "info";

// The writer thread stops when its guard drops
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    #[default]
    Auto,
    Journald,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `picvault::reorganize=debug`.
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub backend: LogBackend,

    /// Directory for the file backend; the platform data dir when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_level() -> String {
    DEFAULT_LEVEL.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            backend: LogBackend::default(),
            dir: None,
        }
    }
}

impl LoggingConfig {
    pub fn log_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(default_log_dir)
    }
}

/// Pick the filter directive: `PICVAULT_LOG` if set and valid, then the
/// configured level, then `info`.
fn filter_directive(env: Option<&str>, configured: &str) -> String {
    [env, Some(configured)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|d| !d.is_empty() && EnvFilter::try_new(d).is_ok())
        .unwrap_or(DEFAULT_LEVEL)
        .to_string()
}

fn build_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}

/// Install the global subscriber. Returns the backend that was set up, which
/// differs from the configured one only for `auto`.
pub fn init(config: &LoggingConfig) -> Result<LogBackend> {
    let env = std::env::var(LOG_ENV).ok();
    let directive = filter_directive(env.as_deref(), &config.level);

    if config.backend != LogBackend::File {
        if init_journald(&directive)? {
            tracing::info!("Logging to journald");
            return Ok(LogBackend::Journald);
        }
        if config.backend == LogBackend::Journald {
            bail!("journald logging requested but the journal is not reachable");
        }
    }

    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(build_filter(&directive))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::info!("Logging to {}", log_dir.join(LOG_FILE).display());
    Ok(LogBackend::File)
}

#[cfg(target_os = "linux")]
fn init_journald(directive: &str) -> Result<bool> {
    let Ok(journald_layer) = tracing_journald::layer() else {
        return Ok(false);
    };
    tracing_subscriber::registry()
        .with(build_filter(directive))
        .with(journald_layer)
        .try_init()?;
    Ok(true)
}

#[cfg(not(target_os = "linux"))]
fn init_journald(_directive: &str) -> Result<bool> {
    Ok(false)
}

pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("picvault")
        .join("logs")
}

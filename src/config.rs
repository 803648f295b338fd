//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the console.
//! Configuration is loaded from:
//! 1. `config/peppermint.toml` (base configuration)
//! 2. Environment variables (prefixed with `PEPPERMINT_`)
//!
//! Every section has defaults, so a missing file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use peppermint::config::ConsoleConfig;
//!
//! let config = ConsoleConfig::load()?;
//! println!("Database: {}", config.storage.database_path.display());
//! # Ok::<(), peppermint::error::ConsoleError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, ConsoleError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Time-series store settings
    pub storage: StorageConfig,
    /// Continuous logger settings
    pub logger: LoggerConfig,
    /// Action sequence settings
    pub sequence: SequenceConfig,
    /// Live chart settings
    pub chart: ChartConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file, one per session
    pub database_path: PathBuf,
    /// How long a connection waits on a locked database before failing
    pub busy_timeout_ms: u64,
}

/// Continuous logger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Interval between data source polls
    pub poll_interval_ms: u64,
    /// Join bound for `stop_logging`
    pub stop_timeout_ms: u64,
}

/// Action sequence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Interval between `is_active` checks
    pub poll_interval_ms: u64,
    /// Join bound for `stop`
    pub join_timeout_ms: u64,
}

/// Live chart configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    /// Debounce window for file change notifications
    pub debounce_ms: u64,
    /// Rows fetched per refresh
    pub tail_batch: usize,
    /// Upper bound on the widened tail window when catching up on a gap
    pub max_catch_up: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Peppermint".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./datasaver.db"),
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            stop_timeout_ms: 5000,
        }
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            join_timeout_ms: 5000,
        }
    }
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            tail_batch: 1000,
            max_catch_up: 16_000,
        }
    }
}

impl LoggerConfig {
    /// Tick period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Bound on joining the logging thread.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl SequenceConfig {
    /// Status poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Bound on joining the worker thread.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl ChartConfig {
    /// Quiet window before refreshing.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl StorageConfig {
    /// SQLite busy timeout.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl ConsoleConfig {
    /// Load configuration from `config/peppermint.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `PEPPERMINT_`, sections
    /// separated by a double underscore.
    /// Example: `PEPPERMINT_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/peppermint.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(ConsoleConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PEPPERMINT_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConsoleError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.storage.database_path.as_os_str().is_empty() {
            return Err(ConsoleError::Configuration(
                "storage.database_path must not be empty".to_string(),
            ));
        }

        let intervals = [
            ("logger.poll_interval_ms", self.logger.poll_interval_ms),
            ("sequence.poll_interval_ms", self.sequence.poll_interval_ms),
            ("sequence.join_timeout_ms", self.sequence.join_timeout_ms),
            ("chart.debounce_ms", self.chart.debounce_ms),
        ];
        for (key, value) in intervals {
            if value == 0 {
                return Err(ConsoleError::Configuration(format!("{key} must be > 0")));
            }
        }

        if self.chart.tail_batch == 0 {
            return Err(ConsoleError::Configuration(
                "chart.tail_batch must be > 0".to_string(),
            ));
        }
        if self.chart.max_catch_up < self.chart.tail_batch {
            return Err(ConsoleError::Configuration(format!(
                "chart.max_catch_up ({}) must be >= chart.tail_batch ({})",
                self.chart.max_catch_up, self.chart.tail_batch
            )));
        }

        Ok(())
    }
}

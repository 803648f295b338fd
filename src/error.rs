//! Custom error types for the console.
//!
//! This module defines the primary error type, `ConsoleError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of failures the measurement pipeline runs into, from configuration issues
//! to flaky instrument I/O and storage contention.
//!
//! ## Error Hierarchy
//!
//! `ConsoleError` groups failures along the lines the pipeline treats differently:
//!
//! - **Transient I/O** (`Instrument`, `Storage`, `Io`, `Watcher`): a single bad read or a
//!   momentarily locked database. Poll loops log these and keep going.
//! - **Configuration** (`Config`, `Configuration`, `InvalidSweep`, `ParameterNotGettable`,
//!   `ParameterNotSettable`, `UnknownTable`, `InvalidIdentifier`): raised at setup, before
//!   any thread is spawned or any column is added.
//! - **Lifecycle** (`LoggerAlreadyRunning`, `StopTimeout`, `Sequence`): misuse of a
//!   component or a worker that did not honour a cooperative stop in time.
//!
//! `is_transient()` exposes that split so callers can decide whether to retry on the
//! next tick or surface the failure to the operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the console error type.
pub type AppResult<T> = std::result::Result<T, ConsoleError>;

/// Primary error type for the console.
#[derive(Error, Debug)]
pub enum ConsoleError {
    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite failure. Lock contention (`SQLITE_BUSY`) lands here as well.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The named table was never registered.
    #[error("Table '{0}' does not exist")]
    UnknownTable(String),

    /// Table and column names are quoted, but empty names are still rejected.
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// Communication or protocol failure reported by an instrument.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Read attempted on a write-only parameter.
    #[error("Parameter '{0}' cannot be read")]
    ParameterNotGettable(String),

    /// Write attempted on a read-only parameter.
    #[error("Parameter '{0}' cannot be set")]
    ParameterNotSettable(String),

    /// Sweep range or driver is unusable.
    #[error("Invalid sweep: {0}")]
    InvalidSweep(String),

    /// `start` called while a logging thread is alive.
    #[error("Logger is already running")]
    LoggerAlreadyRunning,

    /// A background worker did not exit within its join bound.
    #[error("{component} did not stop within {timeout:?}")]
    StopTimeout {
        /// Worker that overran.
        component: &'static str,
        /// Bound that was exceeded.
        timeout: Duration,
    },

    /// Sequence misuse or measurement failure.
    #[error("Sequence error: {0}")]
    Sequence(String),

    /// File watcher failure.
    #[error("File watcher error: {0}")]
    Watcher(#[from] notify::Error),
}

impl From<figment::Error> for ConsoleError {
    fn from(err: figment::Error) -> Self {
        ConsoleError::Config(Box::new(err))
    }
}

impl ConsoleError {
    /// Whether this failure should be contained at the current poll tick.
    ///
    /// Transient errors are logged and retried on the next tick; everything else is
    /// surfaced to whoever initiated the operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConsoleError::Io(_)
                | ConsoleError::Storage(_)
                | ConsoleError::Instrument(_)
                | ConsoleError::Watcher(_)
        )
    }

    /// Shorthand for wrapping driver failures.
    pub fn instrument(message: impl Into<String>) -> Self {
        ConsoleError::Instrument(message.into())
    }
}

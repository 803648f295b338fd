//! # Peppermint Core Library
//!
//! This crate is the measurement pipeline behind the `peppermint` console: it runs
//! ordered measurement actions against bench instruments, logs their readings into a
//! dynamically schematized SQLite store, and streams new rows to live charts. The
//! binary (`main.rs`) is a thin command-line front end over this library.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration loading (`config/peppermint.toml` plus
//!   `PEPPERMINT_` environment overrides). See `config::ConsoleConfig`.
//! - **`core`**: Shared data types: `ParameterId`, `DataPoint`, `SweepRange`.
//! - **`error`**: The crate-wide `ConsoleError` enum and `AppResult` alias.
//! - **`store`**: `TimeSeriesStore`, one append-only table per run with columns
//!   added as new parameters appear.
//! - **`logger`**: `ContinuousLogger` and the `LoggingStrategy` family that decides
//!   when polling stops.
//! - **`instrument`**: The `Parameter`/`Instrument` boundary, model identification and
//!   simulated instruments.
//! - **`measurement`**: The `Measurement` trait and the `Setter`, `Monitor` and
//!   `Sweep1D` adapters.
//! - **`sequence`**: `ActionSequence`, which runs measurements one at a time with
//!   pause, resume and stop.
//! - **`chart`**: File change watching, debouncing and the `StreamingChartSink` that
//!   feeds chart backends through a render loop.
//! - **`state`**: `ConsoleState`, the shared instrument and parameter selections with
//!   change broadcasts.
//! - **`stats`**: Rolling statistics for monitored channels.
//! - **`tracing_setup`**: `tracing-subscriber` initialisation.

pub mod chart;
pub mod config;
pub mod core;
pub mod error;
pub mod instrument;
pub mod logger;
pub mod measurement;
pub mod sequence;
pub mod state;
pub mod stats;
pub mod store;
mod sync;
pub mod tracing_setup;

pub use error::{AppResult, ConsoleError};

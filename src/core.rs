//! Core data types shared by the store, the loggers and the measurement adapters.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppResult, ConsoleError};

/// Names of the implicit columns every run table carries.
pub const ID_COLUMN: &str = "id";
/// Insertion time of a row.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Stable identity of an instrument parameter.
///
/// The full name joins the instrument name, any submodule names and the parameter
/// name with underscores (`ls336_A_temperature`). It doubles as the column name in
/// the time-series store, so it must not change for the lifetime of a run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterId {
    parts: Vec<String>,
}

impl ParameterId {
    /// Build from instrument, submodule and parameter names.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    /// Underscore-joined full name.
    pub fn full_name(&self) -> String {
        self.parts.join("_")
    }

    /// `[instrument, submodule..., parameter]`
    pub fn name_parts(&self) -> &[String] {
        &self.parts
    }

    /// The leaf parameter name, e.g. `temperature`.
    pub fn short_name(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or_default()
    }

    /// The owning instrument's name.
    pub fn instrument(&self) -> &str {
        self.parts.first().map(String::as_str).unwrap_or_default()
    }

    /// A child identity one level below this one.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut parts = self.parts.clone();
        parts.push(name.into());
        Self { parts }
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// A single `(parameter, value)` reading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Column name in the store (a parameter full name).
    pub parameter: String,
    /// Reading.
    pub value: f64,
}

impl DataPoint {
    /// Point for `parameter`.
    pub fn new(parameter: impl Into<String>, value: f64) -> Self {
        Self {
            parameter: parameter.into(),
            value,
        }
    }
}

/// Points that were read in the same tick and are stored as one row.
pub type Row = Vec<DataPoint>;

/// Linear sweep from `start` to `stop` (inclusive) in `points` steps.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    /// First setpoint.
    pub start: f64,
    /// Last setpoint.
    pub stop: f64,
    /// Number of setpoints, at least 2.
    pub points: usize,
}

impl SweepRange {
    /// Validated range.
    pub fn new(start: f64, stop: f64, points: usize) -> AppResult<Self> {
        let range = Self {
            start,
            stop,
            points,
        };
        range.validate()?;
        Ok(range)
    }

    /// Reject ranges no instrument could execute.
    pub fn validate(&self) -> AppResult<()> {
        if !self.start.is_finite() || !self.stop.is_finite() {
            return Err(ConsoleError::InvalidSweep(format!(
                "endpoints must be finite (start={}, stop={})",
                self.start, self.stop
            )));
        }
        if self.points < 2 {
            return Err(ConsoleError::InvalidSweep(format!(
                "need at least 2 points, got {}",
                self.points
            )));
        }
        if self.start == self.stop {
            return Err(ConsoleError::InvalidSweep(format!(
                "start and stop are both {}",
                self.start
            )));
        }
        Ok(())
    }

    /// Distance between adjacent setpoints.
    pub fn step(&self) -> f64 {
        (self.stop - self.start) / (self.points.saturating_sub(1).max(1)) as f64
    }

    /// Setpoint for step `i`, clamped to the last point.
    pub fn value_at(&self, i: usize) -> f64 {
        if i + 1 >= self.points {
            return self.stop;
        }
        self.start + self.step() * i as f64
    }

    /// Every setpoint of the sweep.
    pub fn values(&self) -> Vec<f64> {
        (0..self.points).map(|i| self.value_at(i)).collect()
    }
}

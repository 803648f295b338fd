//! Chart-facing data types and the backend boundary.

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::core::{ID_COLUMN, TIMESTAMP_COLUMN};
use crate::store::{CellValue, ColumnarData};

/// A single plottable value.
#[derive(Debug, Clone, PartialEq)]
pub enum ChartValue {
    /// No value for this row.
    Missing,
    /// Plain numeric reading.
    Number(f64),
    /// Row timestamp.
    Time(DateTime<Utc>),
}

impl ChartValue {
    /// Numeric value, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChartValue::Number(v) => Some(*v),
            _ => None,
        }
    }
}

/// SQLite `strftime('%Y-%m-%d %H:%M:%f')` output, with or without fractional seconds.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text.trim(), format).ok())
        .map(|naive| naive.and_utc())
}

/// Column-oriented batch ready for a chart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChartBatch {
    ids: Vec<i64>,
    columns: Vec<(String, Vec<ChartValue>)>,
}

impl ChartBatch {
    /// Convert store output. The id column becomes the batch's row ids, the
    /// timestamp column is parsed to chart time and everything else is numeric.
    pub fn from_columnar(data: &ColumnarData) -> Self {
        let ids = data.ids();
        let columns = data
            .iter()
            .filter(|(name, _)| *name != ID_COLUMN)
            .map(|(name, values)| {
                let converted = if name == TIMESTAMP_COLUMN {
                    values
                        .iter()
                        .map(|v| match v {
                            CellValue::Text(text) => parse_timestamp(text)
                                .map(ChartValue::Time)
                                .unwrap_or(ChartValue::Missing),
                            _ => ChartValue::Missing,
                        })
                        .collect()
                } else {
                    values
                        .iter()
                        .map(|v| v.as_f64().map(ChartValue::Number).unwrap_or(ChartValue::Missing))
                        .collect()
                };
                (name.to_string(), converted)
            })
            .collect();
        Self { ids, columns }
    }

    /// Row ids in ascending order.
    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when the batch carries no rows.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Highest row id in the batch.
    pub fn max_id(&self) -> Option<i64> {
        self.ids.iter().copied().max()
    }

    /// Values of one column, aligned with [`ChartBatch::ids`].
    pub fn column(&self, name: &str) -> Option<&[ChartValue]> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, values)| values.as_slice())
    }

    /// All data columns in insertion order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &[ChartValue])> {
        self.columns
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Rows with id strictly greater than `watermark`.
    pub fn after(&self, watermark: i64) -> Self {
        let keep: Vec<usize> = (0..self.ids.len())
            .filter(|&i| self.ids[i] > watermark)
            .collect();
        if keep.len() == self.ids.len() {
            return self.clone();
        }
        Self {
            ids: keep.iter().map(|&i| self.ids[i]).collect(),
            columns: self
                .columns
                .iter()
                .map(|(name, values)| {
                    let kept = keep
                        .iter()
                        .map(|&i| values.get(i).cloned().unwrap_or(ChartValue::Missing))
                        .collect();
                    (name.clone(), kept)
                })
                .collect(),
        }
    }
}

/// The chart front end.
///
/// Called only from the render loop. Traces are registered before any batch that
/// carries them is appended, and appends only ever carry rows not seen before.
pub trait ChartBackend: Send {
    /// Initial history at attach time.
    fn seed(&mut self, batch: &ChartBatch);

    /// Add a trace for a column that appeared after attach.
    fn register_trace(&mut self, column: &str);

    /// Stream new rows onto the existing traces.
    fn append(&mut self, batch: &ChartBatch);
}

/// What a [`MemoryChart`] has been shown so far.
#[derive(Debug, Default, Clone)]
pub struct MemoryChartData {
    /// Registered traces, in registration order.
    pub traces: Vec<String>,
    /// Every row id shown.
    pub ids: Vec<i64>,
    /// Per-column values.
    pub points: BTreeMap<String, Vec<ChartValue>>,
    /// Rows in the seed batch.
    pub seeded_rows: usize,
    /// Number of append calls.
    pub appends: usize,
}

/// Backend that keeps everything in memory. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryChart {
    data: Arc<Mutex<MemoryChartData>>,
}

impl MemoryChart {
    /// Empty chart.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything shown so far.
    pub fn snapshot(&self) -> MemoryChartData {
        self.data.lock().clone()
    }

    fn extend(data: &mut MemoryChartData, batch: &ChartBatch) {
        data.ids.extend_from_slice(batch.ids());
        for (name, values) in batch.columns() {
            data.points
                .entry(name.to_string())
                .or_default()
                .extend_from_slice(values);
        }
    }
}

impl ChartBackend for MemoryChart {
    fn seed(&mut self, batch: &ChartBatch) {
        let mut data = self.data.lock();
        data.seeded_rows = batch.len();
        Self::extend(&mut data, batch);
    }

    fn register_trace(&mut self, column: &str) {
        let mut data = self.data.lock();
        if !data.traces.iter().any(|t| t == column) {
            data.traces.push(column.to_string());
        }
    }

    fn append(&mut self, batch: &ChartBatch) {
        let mut data = self.data.lock();
        data.appends += 1;
        Self::extend(&mut data, batch);
    }
}

/// Backend that writes each update to the log, for headless runs.
pub struct LogChart {
    title: String,
}

impl LogChart {
    /// Chart that logs under `title`.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }

    fn latest(batch: &ChartBatch) -> String {
        batch
            .columns()
            .filter_map(|(name, values)| {
                values
                    .last()
                    .and_then(ChartValue::as_f64)
                    .map(|v| format!("{name}={v:.4e}"))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ChartBackend for LogChart {
    fn seed(&mut self, batch: &ChartBatch) {
        info!(chart = %self.title, rows = batch.len(), "Chart seeded");
    }

    fn register_trace(&mut self, column: &str) {
        info!(chart = %self.title, trace = column, "New trace");
    }

    fn append(&mut self, batch: &ChartBatch) {
        info!(
            chart = %self.title,
            rows = batch.len(),
            last_id = batch.max_id().unwrap_or_default(),
            "{}",
            Self::latest(batch)
        );
    }
}

//! Live charts fed from the time-series store.
//!
//! [`ChangeWatcher`] turns store file writes into debounced notifications,
//! [`StreamingChartSink`] turns notifications into append-only batches, and the
//! [`RenderLoop`] applies those batches on the thread that owns the chart.

pub mod backend;
pub mod render;
pub mod sink;
pub mod watcher;

pub use backend::{ChartBackend, ChartBatch, ChartValue, LogChart, MemoryChart};
pub use render::{RenderHandle, RenderLoop};
pub use sink::StreamingChartSink;
pub use watcher::{ChangeWatcher, Debouncer, Subscription};

//! Incremental streaming of one table onto one chart.
//!
//! At attach time the sink seeds the chart with the whole table. After that, every
//! debounced change notification runs [`StreamingChartSink::refresh`]:
//!
//! 1. re-read the column list and register traces for new data columns
//! 2. fetch a bounded tail window
//! 3. keep only rows above the watermark
//! 4. convert timestamps to chart time
//! 5. advance the watermark
//! 6. schedule the append on the render loop
//!
//! The render side keeps its own watermark and filters again before appending, so
//! overlapping refreshes can never deliver a row twice.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::backend::{ChartBackend, ChartBatch};
use super::render::RenderHandle;
use super::watcher::{ChangeWatcher, Subscription};
use crate::config::ChartConfig;
use crate::core::{ID_COLUMN, TIMESTAMP_COLUMN};
use crate::error::AppResult;
use crate::store::{ColumnarData, TimeSeriesStore};

/// Chart-side state, touched only by render loop tasks.
struct ChartState {
    backend: Box<dyn ChartBackend>,
    delivered: i64,
    traces: HashSet<String>,
}

impl ChartState {
    fn register(&mut self, columns: &[String]) {
        for column in columns {
            if self.traces.insert(column.clone()) {
                self.backend.register_trace(column);
            }
        }
    }

    fn append(&mut self, batch: &ChartBatch) {
        let fresh = batch.after(self.delivered);
        let Some(max_id) = fresh.max_id() else {
            return;
        };
        self.delivered = max_id;
        self.backend.append(&fresh);
    }
}

struct SinkShared {
    store: Arc<TimeSeriesStore>,
    table: String,
    tail_batch: usize,
    max_catch_up: usize,
    watermark: AtomicI64,
    known_columns: Mutex<Vec<String>>,
    /// Serializes refreshes from overlapping timer threads.
    refreshing: Mutex<()>,
    chart: Arc<Mutex<ChartState>>,
    render: RenderHandle,
}

fn data_columns(columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .filter(|c| *c != ID_COLUMN && *c != TIMESTAMP_COLUMN)
        .cloned()
        .collect()
}

impl SinkShared {
    fn refresh(&self) -> AppResult<usize> {
        let _guard = self.refreshing.lock();

        let columns = self.store.get_columns(&self.table)?;
        let added: Vec<String> = {
            let mut known = self.known_columns.lock();
            let added: Vec<String> = columns
                .iter()
                .filter(|c| !known.contains(*c))
                .cloned()
                .collect();
            known.extend(added.iter().cloned());
            data_columns(&added)
        };
        if !added.is_empty() {
            debug!(table = %self.table, columns = ?added, "New chart traces");
            let chart = self.chart.clone();
            self.render.schedule(move || chart.lock().register(&added));
        }

        let watermark = self.watermark.load(Ordering::SeqCst);
        let fresh = self.fetch_since(watermark)?;
        let Some(max_id) = fresh.max_id() else {
            return Ok(0);
        };
        self.watermark.fetch_max(max_id, Ordering::SeqCst);

        let batch = ChartBatch::from_columnar(&fresh);
        let rows = batch.len();
        let chart = self.chart.clone();
        self.render.schedule(move || chart.lock().append(&batch));
        Ok(rows)
    }

    /// Rows above `watermark`, widening the tail window while a gap remains.
    fn fetch_since(&self, watermark: i64) -> AppResult<ColumnarData> {
        let mut window = self.tail_batch;
        loop {
            let tail = self.store.get_tail_values(&self.table, window)?;
            let whole_table = tail.len() < window;
            let oldest = tail.ids().into_iter().min();
            let gap = oldest.is_some_and(|id| id > watermark + 1);

            if whole_table || !gap {
                return Ok(tail.rows_after(watermark));
            }
            if window >= self.max_catch_up {
                warn!(
                    table = %self.table,
                    watermark,
                    oldest = oldest.unwrap_or_default(),
                    "Chart fell behind by more than {} rows, skipping the gap",
                    self.max_catch_up
                );
                return Ok(tail.rows_after(watermark));
            }
            window = window.saturating_mul(2).min(self.max_catch_up);
        }
    }
}

/// Streams new rows of one table onto one chart backend.
///
/// Dropping the sink removes its watcher subscription.
pub struct StreamingChartSink {
    shared: Arc<SinkShared>,
    _subscription: Option<Subscription>,
}

impl StreamingChartSink {
    /// Seed `backend` with the current table contents. Call [`subscribe`] or use
    /// [`attach`] to receive updates.
    ///
    /// [`subscribe`]: StreamingChartSink::subscribe
    /// [`attach`]: StreamingChartSink::attach
    pub fn new<B>(
        store: Arc<TimeSeriesStore>,
        table: &str,
        backend: B,
        render: RenderHandle,
        config: &ChartConfig,
    ) -> AppResult<Self>
    where
        B: ChartBackend + 'static,
    {
        let columns = store.get_columns(table)?;
        let history = store.get_table_values(table)?;
        let watermark = history.max_id().unwrap_or(0);

        let chart = Arc::new(Mutex::new(ChartState {
            backend: Box::new(backend),
            delivered: watermark,
            traces: HashSet::new(),
        }));
        let traces = data_columns(&columns);
        let seed = ChartBatch::from_columnar(&history);
        {
            let chart = chart.clone();
            render.schedule(move || {
                let mut chart = chart.lock();
                chart.register(&traces);
                chart.backend.seed(&seed);
            });
        }

        debug!(table, rows = history.len(), "Chart attached");
        Ok(Self {
            shared: Arc::new(SinkShared {
                store,
                table: table.to_string(),
                tail_batch: config.tail_batch.max(1),
                max_catch_up: config.max_catch_up.max(config.tail_batch),
                watermark: AtomicI64::new(watermark),
                known_columns: Mutex::new(columns),
                refreshing: Mutex::new(()),
                chart,
                render,
            }),
            _subscription: None,
        })
    }

    /// Seed the chart and refresh it on every change the watcher reports.
    pub fn attach<B>(
        store: Arc<TimeSeriesStore>,
        table: &str,
        backend: B,
        watcher: &ChangeWatcher,
        render: RenderHandle,
        config: &ChartConfig,
    ) -> AppResult<Self>
    where
        B: ChartBackend + 'static,
    {
        let mut sink = Self::new(store, table, backend, render, config)?;
        sink.subscribe(watcher);
        Ok(sink)
    }

    /// Route `watcher` notifications to [`refresh`](Self::refresh), replacing any
    /// previous subscription.
    pub fn subscribe(&mut self, watcher: &ChangeWatcher) {
        let shared = Arc::downgrade(&self.shared);
        self._subscription = Some(watcher.subscribe(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let refreshed = shared.refresh();
            // Debounce timer threads are short-lived; their connections must not outlive them.
            shared.store.release_thread_connection();
            if let Err(e) = refreshed {
                warn!(table = %shared.table, "Chart refresh skipped: {e}");
            }
        }));
    }

    /// Pull unseen rows and schedule them for the chart. Returns the row count.
    pub fn refresh(&self) -> AppResult<usize> {
        self.shared.refresh()
    }

    /// Table this sink follows.
    pub fn table(&self) -> &str {
        &self.shared.table
    }

    /// Highest row id handed to the render loop so far.
    pub fn watermark(&self) -> i64 {
        self.shared.watermark.load(Ordering::SeqCst)
    }

    /// Columns the sink has registered traces for.
    pub fn known_columns(&self) -> Vec<String> {
        self.shared.known_columns.lock().clone()
    }
}

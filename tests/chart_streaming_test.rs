//! Integration tests for live chart streaming.
//!
//! A continuous logger writes into the store while a `ChangeWatcher` drives a
//! `StreamingChartSink`; the render loop runs on the test thread, the way a UI
//! thread would drive it.

use peppermint::chart::{ChangeWatcher, MemoryChart, RenderLoop, StreamingChartSink};
use peppermint::config::ChartConfig;
use peppermint::core::{DataPoint, Row};
use peppermint::logger::{ContinuousLogger, ManualStop};
use peppermint::store::TimeSeriesStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn chart_config() -> ChartConfig {
    ChartConfig {
        debounce_ms: 20,
        tail_batch: 8,
        max_catch_up: 1024,
    }
}

/// Pump the render loop until `condition` holds on the chart.
fn render_until(render: &mut RenderLoop, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        render.run_pending();
        if condition() {
            return;
        }
        assert!(Instant::now() < deadline, "chart did not catch up in time");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Writes `v` every tick and starts writing `w` from tick 10 on.
fn growing_source() -> impl FnMut() -> anyhow::Result<Vec<Row>> + Send {
    let tick = AtomicUsize::new(0);
    move || -> anyhow::Result<Vec<Row>> {
        let n = tick.fetch_add(1, Ordering::SeqCst);
        let mut row = vec![DataPoint::new("v", n as f64)];
        if n >= 10 {
            row.push(DataPoint::new("w", -(n as f64)));
        }
        Ok(vec![row])
    }
}

#[test]
fn live_rows_reach_the_chart_exactly_once() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TimeSeriesStore::open(dir.path().join("live.db")).unwrap());
    let table = store.register_table("live").unwrap();
    store.add_result(&table, &[DataPoint::new("v", -1.0)]).unwrap();

    let (mut render, handle) = RenderLoop::new();
    let watcher = ChangeWatcher::new(store.path(), Duration::from_millis(20)).unwrap();
    let chart = MemoryChart::new();
    let sink = StreamingChartSink::attach(
        store.clone(),
        &table,
        chart.clone(),
        &watcher,
        handle,
        &chart_config(),
    )
    .unwrap();
    render.run_pending();
    assert_eq!(chart.snapshot().seeded_rows, 1);
    assert_eq!(chart.snapshot().traces, vec!["v".to_string()]);

    let logger = ContinuousLogger::new(store.clone(), &table).with_interval(Duration::from_millis(5));
    let (strategy, stop) = ManualStop::new();
    logger.start_logging(growing_source(), strategy).unwrap();

    // Nudge the watcher as well, in case the platform coalesces file events.
    render_until(&mut render, || {
        watcher.notify_changed();
        chart.snapshot().ids.len() >= 30
    });
    stop.stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    while logger.is_logging() {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }

    let all_ids = store.get_table_values(&table).unwrap().ids();
    sink.refresh().unwrap();
    render_until(&mut render, || chart.snapshot().ids.len() == all_ids.len());

    let shown = chart.snapshot();
    assert_eq!(shown.ids, all_ids);
    assert!(shown.ids.windows(2).all(|w| w[0] < w[1]));
    assert!(shown.traces.contains(&"w".to_string()));
    assert_eq!(shown.points["v"].len(), all_ids.len());
    assert_eq!(sink.watermark(), *all_ids.last().unwrap());
}

#[test]
fn file_events_drive_refresh_without_nudging() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TimeSeriesStore::open(dir.path().join("events.db")).unwrap());
    let table = store.register_table("events").unwrap();

    let (mut render, handle) = RenderLoop::new();
    let watcher = ChangeWatcher::for_store(&store, &chart_config()).unwrap();
    let chart = MemoryChart::new();
    let _sink = StreamingChartSink::attach(
        store.clone(),
        &table,
        chart.clone(),
        &watcher,
        handle,
        &chart_config(),
    )
    .unwrap();

    for i in 0..5 {
        store.add_result(&table, &[DataPoint::new("v", f64::from(i))]).unwrap();
    }
    render_until(&mut render, || chart.snapshot().ids.len() == 5);
    assert!(chart.snapshot().appends >= 1);
}

#[test]
fn dropping_the_sink_unsubscribes() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TimeSeriesStore::open(dir.path().join("drop.db")).unwrap());
    let table = store.register_table("t").unwrap();
    let (_render, handle) = RenderLoop::new();
    let watcher = ChangeWatcher::new(store.path(), Duration::from_millis(20)).unwrap();

    let sink = StreamingChartSink::attach(
        store.clone(),
        &table,
        MemoryChart::new(),
        &watcher,
        handle,
        &chart_config(),
    )
    .unwrap();
    assert_eq!(watcher.subscriber_count(), 1);
    drop(sink);
    assert_eq!(watcher.subscriber_count(), 0);
}

#[test]
fn debounced_refreshes_do_not_accumulate_connections() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TimeSeriesStore::open(dir.path().join("bounded.db")).unwrap());
    let table = store.register_table("bounded").unwrap();

    let (mut render, handle) = RenderLoop::new();
    let watcher = ChangeWatcher::for_store(&store, &chart_config()).unwrap();
    let chart = MemoryChart::new();
    let _sink = StreamingChartSink::attach(
        store.clone(),
        &table,
        chart.clone(),
        &watcher,
        handle,
        &chart_config(),
    )
    .unwrap();
    render.run_pending();
    let baseline = store.open_connections();

    // One write per debounce window, so every row arrives in its own batch.
    for i in 0..12 {
        store.add_result(&table, &[DataPoint::new("v", f64::from(i))]).unwrap();
        watcher.notify_changed();
        let expected = i as usize + 1;
        render_until(&mut render, || chart.snapshot().ids.len() == expected);
    }
    assert!(chart.snapshot().appends >= 12);

    let deadline = Instant::now() + Duration::from_secs(5);
    while store.open_connections() > baseline {
        assert!(
            Instant::now() < deadline,
            "connections grew from {baseline} to {}",
            store.open_connections()
        );
        thread::sleep(Duration::from_millis(10));
    }
}

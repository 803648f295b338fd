//! Background poller that moves data source output into the store.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::strategy::LoggingStrategy;
use crate::config::LoggerConfig;
use crate::core::Row;
use crate::error::{AppResult, ConsoleError};
use crate::store::TimeSeriesStore;
use crate::sync::Signal;

/// Something the logger can poll for new rows.
///
/// Each call should return only the data produced since the previous call. Every
/// returned [`Row`] becomes one table row.
pub trait DataSource: Send {
    /// Rows produced since the previous call. An empty vec means nothing new.
    fn poll(&mut self) -> anyhow::Result<Vec<Row>>;
}

impl<F> DataSource for F
where
    F: FnMut() -> anyhow::Result<Vec<Row>> + Send,
{
    fn poll(&mut self) -> anyhow::Result<Vec<Row>> {
        self()
    }
}

/// Polls one data source into one table on a dedicated thread.
///
/// A logger runs at most one poll loop at a time; give each measurement its own
/// logger rather than sharing one.
pub struct ContinuousLogger {
    store: Arc<TimeSeriesStore>,
    table: String,
    interval: Duration,
    stop_timeout: Duration,
    logging: Arc<AtomicBool>,
    rows_written: Arc<AtomicU64>,
    signal: Arc<Signal>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Runs strategy cleanup and clears the logging flag when the poll loop exits,
/// including by panic.
struct LoopExit {
    strategy: Box<dyn LoggingStrategy>,
    store: Arc<TimeSeriesStore>,
    logging: Arc<AtomicBool>,
}

impl Drop for LoopExit {
    fn drop(&mut self) {
        self.strategy.cleanup();
        self.store.release_thread_connection();
        self.logging.store(false, Ordering::SeqCst);
    }
}

impl ContinuousLogger {
    /// Logger writing to `table` with default timing.
    pub fn new(store: Arc<TimeSeriesStore>, table: impl Into<String>) -> Self {
        Self::from_config(store, table, &LoggerConfig::default())
    }

    /// Logger with timing taken from `config`.
    pub fn from_config(
        store: Arc<TimeSeriesStore>,
        table: impl Into<String>,
        config: &LoggerConfig,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            interval: config.poll_interval(),
            stop_timeout: config.stop_timeout(),
            logging: Arc::new(AtomicBool::new(false)),
            rows_written: Arc::new(AtomicU64::new(0)),
            signal: Arc::new(Signal::default()),
            worker: Mutex::new(None),
        }
    }

    /// Set the tick period.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the bound on joining the thread.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Destination table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// True while the logging thread is alive.
    pub fn is_logging(&self) -> bool {
        self.logging.load(Ordering::SeqCst)
    }

    /// Rows appended since this logger was created.
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    /// Spawn the poll loop.
    ///
    /// Fails with [`ConsoleError::LoggerAlreadyRunning`] while a previous loop is
    /// still alive.
    pub fn start_logging<D, S>(&self, source: D, strategy: S) -> AppResult<()>
    where
        D: DataSource + 'static,
        S: LoggingStrategy + 'static,
    {
        if self.logging.swap(true, Ordering::SeqCst) {
            return Err(ConsoleError::LoggerAlreadyRunning);
        }

        let mut worker = self.worker.lock();
        if let Some(previous) = worker.take() {
            // The flag is clear, so the previous loop has already run its cleanup.
            let _ = previous.join();
        }
        self.signal.reset();

        let strategy_name = strategy.name();
        let exit = LoopExit {
            strategy: Box::new(strategy),
            store: self.store.clone(),
            logging: self.logging.clone(),
        };
        let poller = Poller {
            source: Box::new(source),
            store: self.store.clone(),
            table: self.table.clone(),
            rows_written: self.rows_written.clone(),
        };
        let signal = self.signal.clone();
        let interval = self.interval;

        let spawned = thread::Builder::new()
            .name(format!("logger-{}", self.table))
            .spawn(move || run_loop(poller, exit, signal, interval));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!(table = %self.table, strategy = strategy_name, "Logging started");
                Ok(())
            }
            Err(e) => {
                self.logging.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Ask the poll loop to stop and wait for it, up to the stop timeout.
    ///
    /// A no-op when nothing is running.
    pub fn stop_logging(&self) -> AppResult<()> {
        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };
        self.signal.set();

        let deadline = Instant::now() + self.stop_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(table = %self.table, "Logger did not stop within {:?}", self.stop_timeout);
                *self.worker.lock() = Some(handle);
                return Err(ConsoleError::StopTimeout {
                    component: "continuous logger",
                    timeout: self.stop_timeout,
                });
            }
            thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            warn!(table = %self.table, "Logger thread panicked");
        }
        debug!(table = %self.table, "Logging stopped");
        Ok(())
    }
}

impl Drop for ContinuousLogger {
    fn drop(&mut self) {
        self.signal.set();
    }
}

struct Poller {
    source: Box<dyn DataSource>,
    store: Arc<TimeSeriesStore>,
    table: String,
    rows_written: Arc<AtomicU64>,
}

impl Poller {
    fn poll_once(&mut self) {
        let rows = match self.source.poll() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(table = %self.table, "Data source failed: {e:#}");
                return;
            }
        };
        for row in rows {
            match self.store.add_result(&self.table, &row) {
                Ok(()) => {
                    self.rows_written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(table = %self.table, "Failed to append row: {e}"),
            }
        }
    }
}

fn run_loop(mut poller: Poller, mut exit: LoopExit, signal: Arc<Signal>, interval: Duration) {
    loop {
        if signal.is_set() {
            break;
        }
        if !exit.strategy.should_continue_logging() {
            if exit.strategy.drains_on_exhaustion() {
                poller.poll_once();
            }
            break;
        }
        poller.poll_once();
        if signal.wait_timeout(interval) {
            break;
        }
    }
    debug!(table = %poller.table, "Poll loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataPoint;
    use crate::logger::strategy::{BoundedCount, ManualStop};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<TimeSeriesStore>, String) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TimeSeriesStore::open(dir.path().join("log.db")).unwrap());
        let table = store.register_table("log").unwrap();
        (dir, store, table)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    struct CountedCleanup<S> {
        inner: S,
        cleanups: Arc<AtomicUsize>,
    }

    impl<S: LoggingStrategy> LoggingStrategy for CountedCleanup<S> {
        fn should_continue_logging(&mut self) -> bool {
            self.inner.should_continue_logging()
        }
        fn cleanup(&mut self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
        fn name(&self) -> &'static str {
            "counted"
        }
    }

    #[test]
    fn source_failure_does_not_stop_logging() {
        let (_dir, store, table) = setup();
        let logger = ContinuousLogger::new(store.clone(), &table).with_interval(Duration::from_millis(5));

        let ticks = Arc::new(AtomicUsize::new(0));
        let source_ticks = ticks.clone();
        let source = move || -> anyhow::Result<Vec<Row>> {
            let tick = source_ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if tick == 2 {
                anyhow::bail!("read timeout");
            }
            Ok(vec![vec![DataPoint::new("v", tick as f64)]])
        };
        let counter_ticks = ticks.clone();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let strategy = CountedCleanup {
            inner: BoundedCount::new(5, move || Ok(counter_ticks.load(Ordering::SeqCst))),
            cleanups: cleanups.clone(),
        };

        logger.start_logging(source, strategy).unwrap();
        wait_until(|| !logger.is_logging());

        let values: Vec<f64> = store
            .get_column_values(&table, "v")
            .unwrap()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_f64())
            .collect();
        assert_eq!(values, vec![1.0, 3.0, 4.0, 5.0]);
        assert_eq!(logger.rows_written(), 4);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_start_is_rejected() {
        let (_dir, store, table) = setup();
        let logger = ContinuousLogger::new(store, &table).with_interval(Duration::from_millis(5));
        let (strategy, _handle) = ManualStop::new();
        logger
            .start_logging(|| Ok::<Vec<Row>, anyhow::Error>(Vec::new()), strategy)
            .unwrap();

        let (again, _handle) = ManualStop::new();
        let err = logger
            .start_logging(|| Ok::<Vec<Row>, anyhow::Error>(Vec::new()), again)
            .unwrap_err();
        assert!(matches!(err, ConsoleError::LoggerAlreadyRunning));

        logger.stop_logging().unwrap();
        assert!(!logger.is_logging());
    }

    #[test]
    fn stop_interrupts_sleep_and_allows_restart() {
        let (_dir, store, table) = setup();
        let logger = ContinuousLogger::new(store, &table).with_interval(Duration::from_secs(60));
        let (strategy, _handle) = ManualStop::new();
        logger
            .start_logging(|| Ok::<Vec<Row>, anyhow::Error>(Vec::new()), strategy)
            .unwrap();

        let started = Instant::now();
        logger.stop_logging().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!logger.is_logging());

        let (strategy, handle) = ManualStop::new();
        logger
            .start_logging(|| Ok::<Vec<Row>, anyhow::Error>(Vec::new()), strategy)
            .unwrap();
        handle.stop();
        wait_until(|| !logger.is_logging());
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let (_dir, store, table) = setup();
        let logger = ContinuousLogger::new(store, table);
        assert!(logger.stop_logging().is_ok());
        assert!(!logger.is_logging());
    }

    #[test]
    fn bounded_count_drains_after_exhaustion() {
        let (_dir, store, table) = setup();
        let logger = ContinuousLogger::new(store.clone(), &table).with_interval(Duration::from_millis(5));

        // The buffer fills completely between two polls.
        let produced = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let (p, s) = (produced.clone(), seen.clone());
        let source = move || -> anyhow::Result<Vec<Row>> {
            let now = p.load(Ordering::SeqCst);
            let start = s.swap(now, Ordering::SeqCst);
            Ok((start..now).map(|i| vec![DataPoint::new("v", i as f64)]).collect())
        };
        let p = produced.clone();
        let strategy = BoundedCount::new(3, move || {
            // Counter jumps to the full depth on the second read.
            Ok(if p.load(Ordering::SeqCst) == 0 {
                p.store(1, Ordering::SeqCst);
                1
            } else {
                p.store(3, Ordering::SeqCst);
                3
            })
        });

        logger.start_logging(source, strategy).unwrap();
        wait_until(|| !logger.is_logging());
        assert_eq!(store.get_table_values(&table).unwrap().len(), 3);
    }
}

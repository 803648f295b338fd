//! One-dimensional sweeps.
//!
//! Two drivers cover the instruments the console knows:
//!
//! - [`SweepDriver::Buffered`]: the instrument runs the sweep itself and fills an
//!   on-board buffer. The logger drains the buffer from a private cursor and stops
//!   once the buffer holds every point.
//! - [`SweepDriver::Stepped`]: a kick-off thread steps a settable parameter through
//!   the range, dwells, reads the sense parameters and queues one row per step. The
//!   logger drains the queue.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{require_gettable, require_settable, stop_logger, Measurement};
use crate::core::{DataPoint, Row, SweepRange};
use crate::error::{AppResult, ConsoleError};
use crate::instrument::{BufferedSweepInstrument, Parameter, SharedParameter};
use crate::logger::{BoundedCount, ContinuousLogger};
use crate::store::TimeSeriesStore;

const STEPPER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How the sweep is paced.
#[derive(Clone)]
pub enum SweepDriver {
    /// Hardware-paced sweep into the instrument's buffer.
    Buffered(Arc<dyn BufferedSweepInstrument>),
    /// Software-paced sweep of `source`, reading `sense` after each step.
    Stepped {
        /// Settable parameter that is stepped.
        source: SharedParameter,
        /// Parameters read at every step.
        sense: Vec<SharedParameter>,
        /// Settle time between setting and reading.
        dwell: Duration,
    },
}

impl SweepDriver {
    /// Driver name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SweepDriver::Buffered(_) => "buffered",
            SweepDriver::Stepped { .. } => "stepped",
        }
    }

    fn validate(&self) -> AppResult<()> {
        match self {
            SweepDriver::Buffered(_) => Ok(()),
            SweepDriver::Stepped { source, sense, .. } => {
                require_settable(source.as_ref())?;
                for parameter in sense {
                    require_gettable(parameter.as_ref())?;
                }
                Ok(())
            }
        }
    }
}

/// Shared between the stepping thread and the logger's data source.
#[derive(Default)]
struct StepProgress {
    queue: Mutex<VecDeque<Row>>,
    steps: AtomicUsize,
    finished: AtomicBool,
    stop: AtomicBool,
}

/// Linear sweep of one parameter, logged into its own table.
pub struct Sweep1D {
    driver: SweepDriver,
    range: SweepRange,
    logger: ContinuousLogger,
    progress: Arc<StepProgress>,
    stepper: Option<JoinHandle<()>>,
}

impl Sweep1D {
    /// Validates the range and the driver's parameters, then registers the table.
    pub fn new(
        store: Arc<TimeSeriesStore>,
        table: &str,
        driver: SweepDriver,
        range: SweepRange,
    ) -> AppResult<Self> {
        range.validate()?;
        driver.validate()?;
        let table = store.register_table(table)?;
        Ok(Self {
            driver,
            range,
            logger: ContinuousLogger::new(store, table),
            progress: Arc::new(StepProgress::default()),
            stepper: None,
        })
    }

    /// Set the polling period.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.logger = self.logger.with_interval(interval);
        self
    }

    /// Swept range.
    pub fn range(&self) -> &SweepRange {
        &self.range
    }

    /// How the sweep is driven.
    pub fn driver(&self) -> &SweepDriver {
        &self.driver
    }

    fn start_buffered(&mut self, instrument: Arc<dyn BufferedSweepInstrument>) -> AppResult<()> {
        let comm = |e: anyhow::Error| ConsoleError::instrument(format!("{e:#}"));
        instrument.configure_sweep(&self.range).map_err(comm)?;
        instrument.initiate().map_err(comm)?;

        let source_name = instrument.source_parameter().full_name();
        let sense_name = instrument.sense_parameter().full_name();
        let reader = instrument.clone();
        let mut previous = 0usize;
        let source = move || -> anyhow::Result<Vec<Row>> {
            let count = reader.readings_count()?;
            if count <= previous {
                return Ok(Vec::new());
            }
            let readings = reader.read_buffer(previous, count)?;
            let axis = reader.sweep_axis()?;
            let rows = readings
                .iter()
                .enumerate()
                .map(|(offset, reading)| {
                    let mut row = Vec::with_capacity(2);
                    if let Some(setpoint) = axis.get(previous + offset) {
                        row.push(DataPoint::new(source_name.clone(), *setpoint));
                    }
                    row.push(DataPoint::new(sense_name.clone(), *reading));
                    row
                })
                .collect();
            previous += readings.len();
            Ok(rows)
        };

        let counter = instrument.clone();
        let strategy = BoundedCount::new(self.range.points, move || counter.readings_count());
        self.logger.start_logging(source, strategy)
    }

    fn start_stepped(
        &mut self,
        source: SharedParameter,
        sense: Vec<SharedParameter>,
        dwell: Duration,
    ) -> AppResult<()> {
        self.progress = Arc::new(StepProgress::default());

        let drain = self.progress.clone();
        let data_source = move || -> anyhow::Result<Vec<Row>> {
            Ok(drain.queue.lock().drain(..).collect())
        };
        let counter = self.progress.clone();
        let points = self.range.points;
        let strategy = BoundedCount::new(points, move || {
            Ok(if counter.finished.load(Ordering::SeqCst) {
                points
            } else {
                counter.steps.load(Ordering::SeqCst)
            })
        });
        self.logger.start_logging(data_source, strategy)?;

        let progress = self.progress.clone();
        let range = self.range;
        let spawned = thread::Builder::new()
            .name(format!("sweep-{}", self.logger.table()))
            .spawn(move || run_steps(&source, &sense, range, dwell, &progress));
        match spawned {
            Ok(handle) => {
                self.stepper = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.progress.finished.store(true, Ordering::SeqCst);
                stop_logger(&self.logger, "Sweep1D");
                Err(e.into())
            }
        }
    }

    fn join_stepper(&mut self) {
        let Some(handle) = self.stepper.take() else {
            return;
        };
        let deadline = Instant::now() + STEPPER_JOIN_TIMEOUT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(table = self.logger.table(), "Sweep stepper did not stop within {STEPPER_JOIN_TIMEOUT:?}");
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            warn!(table = self.logger.table(), "Sweep stepper panicked");
        }
    }
}

fn run_steps(
    source: &SharedParameter,
    sense: &[SharedParameter],
    range: SweepRange,
    dwell: Duration,
    progress: &StepProgress,
) {
    let source_name = source.full_name();
    for (i, setpoint) in range.values().into_iter().enumerate() {
        if progress.stop.load(Ordering::SeqCst) {
            debug!("Stepped sweep stopped at step {i}");
            break;
        }
        match source.set(setpoint) {
            Ok(()) => {
                if !dwell_interruptibly(dwell, &progress.stop) {
                    break;
                }
                let mut row = vec![DataPoint::new(source_name.clone(), setpoint)];
                for parameter in sense {
                    match parameter.get() {
                        Ok(value) => row.push(DataPoint::new(parameter.full_name(), value)),
                        Err(e) => warn!(parameter = %parameter.full_name(), "Read failed: {e:#}"),
                    }
                }
                progress.queue.lock().push_back(row);
            }
            Err(e) => warn!(parameter = %source_name, setpoint, "Step skipped: {e:#}"),
        }
        progress.steps.fetch_add(1, Ordering::SeqCst);
    }
    progress.finished.store(true, Ordering::SeqCst);
}

/// Sleep `dwell` in short slices. Returns `false` if stopped meanwhile.
fn dwell_interruptibly(dwell: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + dwell;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(Duration::from_millis(10)));
    }
}

impl Measurement for Sweep1D {
    fn start(&mut self) -> AppResult<()> {
        info!(
            table = self.logger.table(),
            driver = self.driver.name(),
            start = self.range.start,
            stop = self.range.stop,
            points = self.range.points,
            "Starting sweep"
        );
        match self.driver.clone() {
            SweepDriver::Buffered(instrument) => self.start_buffered(instrument),
            SweepDriver::Stepped {
                source,
                sense,
                dwell,
            } => self.start_stepped(source, sense, dwell),
        }
    }

    fn is_active(&self) -> AppResult<bool> {
        let instrument_busy = match &self.driver {
            SweepDriver::Buffered(instrument) => instrument
                .is_sweeping()
                .map_err(|e| ConsoleError::instrument(format!("{e:#}")))?,
            SweepDriver::Stepped { .. } => {
                self.stepper.is_some() && !self.progress.finished.load(Ordering::SeqCst)
            }
        };
        Ok(instrument_busy || self.logger.is_logging())
    }

    fn end_data_collection(&mut self) {
        match &self.driver {
            SweepDriver::Buffered(instrument) => {
                if let Err(e) = instrument.abort() {
                    warn!(instrument = instrument.name(), "Abort failed: {e:#}");
                }
            }
            SweepDriver::Stepped { .. } => {
                self.progress.stop.store(true, Ordering::SeqCst);
                self.join_stepper();
            }
        }
        stop_logger(&self.logger, self.kind());
    }

    fn kind(&self) -> &'static str {
        "Sweep1D"
    }

    fn table(&self) -> &str {
        self.logger.table()
    }
}

//! Ordered execution of measurements.
//!
//! An [`ActionSequence`] runs its measurements one at a time on a single worker
//! thread. Measurement `i + 1` never starts before measurement `i` reports
//! inactive, or before the sequence is stopped.
//!
//! ```text
//! Idle -> Running <-> Paused
//!           |           |
//!           +-> Stopping <+ -> Idle
//! any -> Error (terminal)
//! ```
//!
//! Pausing closes a gate in front of the next measurement; the current one runs to
//! completion. Status and progress are plain atomics, so any thread can read them
//! without blocking on the worker.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::SequenceConfig;
use crate::error::{AppResult, ConsoleError};
use crate::measurement::Measurement;
use crate::sync::{Gate, Signal};

/// Lifecycle state of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SequenceState {
    /// Not started, or finished.
    Idle = 0,
    /// Executing a measurement.
    Running = 1,
    /// Held between ticks.
    Paused = 2,
    /// Stop requested, worker winding down.
    Stopping = 3,
    /// Terminal. Build a new sequence to run again.
    Error = 4,
}

impl SequenceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::Stopping,
            4 => Self::Error,
            _ => Self::Idle,
        }
    }
}

/// `(state, current index, current measurement kind)`
pub type SequenceStatus = (SequenceState, Option<usize>, Option<&'static str>);

const NO_CURSOR: usize = usize::MAX;

type MeasurementList = Arc<Mutex<Vec<Box<dyn Measurement>>>>;

struct Shared {
    state: AtomicU8,
    cursor: AtomicUsize,
    completed: AtomicUsize,
    stop_requested: AtomicBool,
    /// Woken on stop so the poll sleep ends early.
    stop: Signal,
    gate: Gate,
    /// Set when the worker has exited.
    finished: Signal,
}

impl Shared {
    fn state(&self) -> SequenceState {
        SequenceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SequenceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move to `to` only if currently `from`.
    fn transition(&self, from: SequenceState, to: SequenceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move to `to` unless the sequence has failed.
    fn settle(&self, to: SequenceState) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != SequenceState::Error as u8).then_some(to as u8)
            });
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Ordered list of measurements with pause/resume/stop control.
pub struct ActionSequence {
    measurements: MeasurementList,
    kinds: Vec<&'static str>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
    join_timeout: Duration,
}

impl ActionSequence {
    /// Sequence over `measurements` with default timing.
    pub fn new(measurements: Vec<Box<dyn Measurement>>) -> Self {
        Self::with_config(measurements, &SequenceConfig::default())
    }

    /// Sequence with timing taken from `config`.
    pub fn with_config(measurements: Vec<Box<dyn Measurement>>, config: &SequenceConfig) -> Self {
        let kinds = measurements.iter().map(|m| m.kind()).collect();
        let finished = Signal::default();
        finished.set();
        Self {
            measurements: Arc::new(Mutex::new(measurements)),
            kinds,
            shared: Arc::new(Shared {
                state: AtomicU8::new(SequenceState::Idle as u8),
                cursor: AtomicUsize::new(NO_CURSOR),
                completed: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(false),
                stop: Signal::default(),
                gate: Gate::default(),
                finished,
            }),
            worker: Mutex::new(None),
            poll_interval: config.poll_interval(),
            join_timeout: config.join_timeout(),
        }
    }

    /// Set the status poll period.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the bound on joining the worker.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Number of measurements.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// True when there are no measurements.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Start the worker. Logs and returns without starting if the sequence is not
    /// idle or has nothing to run.
    pub fn start(&self) {
        if self.kinds.is_empty() {
            warn!("Action sequence is empty, nothing to start");
            return;
        }
        if !self.shared.transition(SequenceState::Idle, SequenceState::Running) {
            warn!(state = ?self.shared.state(), "Action sequence is not idle, ignoring start");
            return;
        }

        let mut worker = self.worker.lock();
        if let Some(previous) = worker.take() {
            let _ = previous.join();
        }

        self.shared.cursor.store(NO_CURSOR, Ordering::SeqCst);
        self.shared.completed.store(0, Ordering::SeqCst);
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.shared.stop.reset();
        self.shared.gate.open();
        self.shared.finished.reset();

        let shared = self.shared.clone();
        let measurements = self.measurements.clone();
        let poll_interval = self.poll_interval;
        let spawned = thread::Builder::new()
            .name("action-sequence".to_string())
            .spawn(move || run_sequence(shared, measurements, poll_interval));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!(measurements = self.kinds.len(), "Action sequence started");
            }
            Err(e) => {
                error!("Failed to spawn sequence worker: {e}");
                self.shared.finished.set();
                self.shared.set_state(SequenceState::Error);
            }
        }
    }

    /// Let the current measurement finish, then hold before the next one.
    pub fn pause(&self) {
        if self.shared.transition(SequenceState::Running, SequenceState::Paused) {
            self.shared.gate.close();
            info!("Action sequence paused");
        } else {
            debug!(state = ?self.shared.state(), "Pause ignored");
        }
    }

    /// Release a pause.
    pub fn resume(&self) {
        if self.shared.transition(SequenceState::Paused, SequenceState::Running) {
            self.shared.gate.open();
            info!("Action sequence resumed");
        } else {
            debug!(state = ?self.shared.state(), "Resume ignored");
        }
    }

    /// Request a cooperative stop and wait for the worker, up to the join timeout.
    ///
    /// The worker ends the current measurement on its way out. A no-op when idle.
    pub fn stop(&self) -> AppResult<()> {
        let state = self.shared.state();
        if state == SequenceState::Idle {
            debug!("Stop ignored, sequence is idle");
            return Ok(());
        }
        if state != SequenceState::Error {
            self.shared.set_state(SequenceState::Stopping);
        }
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.stop.set();
        self.shared.gate.open();

        if !self.shared.finished.wait_timeout(self.join_timeout) {
            error!("Action sequence did not stop within {:?}", self.join_timeout);
            return Err(ConsoleError::StopTimeout {
                component: "action sequence",
                timeout: self.join_timeout,
            });
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("Sequence worker panicked");
            }
        }
        self.shared.settle(SequenceState::Idle);
        info!("Action sequence stopped");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SequenceState {
        self.shared.state()
    }

    /// State plus the current measurement.
    pub fn status(&self) -> SequenceStatus {
        let state = self.shared.state();
        let cursor = match self.shared.cursor.load(Ordering::SeqCst) {
            NO_CURSOR => None,
            index => Some(index),
        };
        let kind = cursor.and_then(|i| self.kinds.get(i).copied());
        (state, cursor, kind)
    }

    /// `(completed, total)`
    pub fn get_progress(&self) -> (usize, usize) {
        (self.shared.completed.load(Ordering::SeqCst), self.kinds.len())
    }

    /// Block until the worker exits. Returns `false` on timeout.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => self.shared.finished.wait_timeout(timeout),
            None => {
                self.shared.finished.wait();
                true
            }
        }
    }
}

impl Drop for ActionSequence {
    fn drop(&mut self) {
        if !self.shared.finished.is_set() {
            if let Err(e) = self.stop() {
                warn!("Dropping a running sequence: {e}");
            }
        }
    }
}

/// Ends the last active measurement and settles the state however the worker exits.
struct WorkerExit {
    shared: Arc<Shared>,
    measurements: MeasurementList,
    last_active: Option<usize>,
}

impl Drop for WorkerExit {
    fn drop(&mut self) {
        if let Some(index) = self.last_active {
            if let Some(measurement) = self.measurements.lock().get_mut(index) {
                debug!(index, kind = measurement.kind(), "Ending data collection");
                measurement.end_data_collection();
            }
        }
        if thread::panicking() {
            self.shared.set_state(SequenceState::Error);
        } else {
            self.shared.settle(SequenceState::Idle);
        }
        self.shared.finished.set();
    }
}

fn fail(shared: &Shared, index: usize, error: ConsoleError) {
    error!(index, "Action sequence failed: {error}");
    shared.set_state(SequenceState::Error);
}

fn run_sequence(shared: Arc<Shared>, measurements: MeasurementList, poll_interval: Duration) {
    let mut exit = WorkerExit {
        shared: shared.clone(),
        measurements: measurements.clone(),
        last_active: None,
    };
    let total = measurements.lock().len();

    for index in 0..total {
        if shared.stopping() {
            break;
        }
        shared.gate.pass();
        if shared.stopping() {
            break;
        }

        shared.cursor.store(index, Ordering::SeqCst);
        exit.last_active = Some(index);

        let started = {
            let mut list = measurements.lock();
            match list.get_mut(index) {
                Some(measurement) => {
                    info!(index, kind = measurement.kind(), table = measurement.table(), "Starting measurement");
                    measurement.start()
                }
                None => break,
            }
        };
        if let Err(e) = started {
            fail(&shared, index, e);
            return;
        }

        loop {
            if shared.stopping() {
                return;
            }
            let active = match measurements.lock().get(index) {
                Some(measurement) => measurement.is_active(),
                None => Ok(false),
            };
            match active {
                Ok(true) => {
                    shared.stop.wait_timeout(poll_interval);
                }
                Ok(false) => break,
                Err(e) => {
                    fail(&shared, index, e);
                    return;
                }
            }
        }

        shared.completed.fetch_add(1, Ordering::SeqCst);
        debug!(index, "Measurement finished");
    }
    info!("Action sequence finished");
}

//! Simulated instruments for demos and tests.
//!
//! # Available Mocks
//!
//! - `MockParameter` - a single value with optional noise, derivation and injected
//!   read failures
//! - `MockSourceMeter` - a Keithley 2450 stand-in with a buffered, self-paced sweep
//! - `MockTemperatureController` - a Lakeshore 336 stand-in with sensor channels A-D
//!   and two heater setpoints

use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{BufferedSweepInstrument, Instrument, InstrumentModel, Parameter, SharedParameter};
use crate::core::{ParameterId, SweepRange};

// =============================================================================
// MockParameter
// =============================================================================

/// Simulated parameter.
///
/// # Example
///
/// ```rust
/// use peppermint::core::ParameterId;
/// use peppermint::instrument::{MockParameter, Parameter};
///
/// let voltage = MockParameter::new(ParameterId::new(["psu", "voltage"]), 0.0);
/// voltage.set(1.5).unwrap();
/// assert_eq!(voltage.get().unwrap(), 1.5);
/// ```
pub struct MockParameter {
    id: ParameterId,
    unit: String,
    value: Mutex<f64>,
    noise: f64,
    gettable: bool,
    settable: bool,
    derived: Option<(Arc<MockParameter>, fn(f64) -> f64)>,
    pending_failures: AtomicUsize,
    reads: AtomicUsize,
}

impl MockParameter {
    /// Readable and settable parameter starting at `initial`.
    pub fn new(id: ParameterId, initial: f64) -> Self {
        Self {
            id,
            unit: String::new(),
            value: Mutex::new(initial),
            noise: 0.0,
            gettable: true,
            settable: true,
            derived: None,
            pending_failures: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    /// Parameter that rejects `set`.
    pub fn read_only(id: ParameterId, initial: f64) -> Self {
        Self {
            settable: false,
            ..Self::new(id, initial)
        }
    }

    /// Parameter that rejects `get`.
    pub fn write_only(id: ParameterId) -> Self {
        Self {
            gettable: false,
            ..Self::new(id, 0.0)
        }
    }

    /// Read-only parameter whose value is `f(source)`.
    pub fn derived(id: ParameterId, source: Arc<MockParameter>, f: fn(f64) -> f64) -> Self {
        Self {
            derived: Some((source, f)),
            ..Self::read_only(id, 0.0)
        }
    }

    /// Set the reported unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Uniform noise of `±amplitude` on every read.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude.abs();
        self
    }

    /// Make the next `n` reads fail as a device timeout would.
    pub fn fail_next_reads(&self, n: usize) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Stored value, without noise or failure injection.
    pub fn value(&self) -> f64 {
        match &self.derived {
            Some((source, f)) => f(source.value()),
            None => *self.value.lock(),
        }
    }

    /// Number of successful reads.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Parameter for MockParameter {
    fn id(&self) -> &ParameterId {
        &self.id
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn gettable(&self) -> bool {
        self.gettable
    }

    fn settable(&self) -> bool {
        self.settable
    }

    fn get(&self) -> anyhow::Result<f64> {
        if !self.gettable {
            bail!("{} is not gettable", self.id);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("VI_ERROR_TMO: timeout reading {}", self.id);
        }

        let mut value = self.value();
        if self.noise > 0.0 {
            value += rand::thread_rng().gen_range(-self.noise..=self.noise);
        }
        Ok(value)
    }

    fn set(&self, value: f64) -> anyhow::Result<()> {
        if !self.settable || self.derived.is_some() {
            bail!("{} is not settable", self.id);
        }
        *self.value.lock() = value;
        Ok(())
    }
}

// =============================================================================
// MockSourceMeter - Simulated Keithley 2450
// =============================================================================

#[derive(Default)]
struct SweepState {
    range: Option<SweepRange>,
    started: Option<Instant>,
    /// Buffer depth frozen by an abort.
    frozen: Option<usize>,
}

/// Source-meter that sources voltage across a fixed load and senses current.
///
/// A configured sweep produces one buffered reading every `point_interval` after
/// [`BufferedSweepInstrument::initiate`], independent of who is polling.
pub struct MockSourceMeter {
    name: String,
    source: Arc<MockParameter>,
    sense: Arc<MockParameter>,
    point_interval: Duration,
    sweep: Mutex<SweepState>,
    pending_failures: AtomicUsize,
    fail_abort: AtomicBool,
    aborts: AtomicUsize,
}

impl MockSourceMeter {
    /// Load resistance in ohms.
    pub const LOAD_OHMS: f64 = 1.0e3;

    /// Source meter named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let base = ParameterId::new([name.clone()]);
        let source = Arc::new(
            MockParameter::new(base.child("source").child("voltage"), 0.0).with_unit("V"),
        );
        let sense = Arc::new(
            MockParameter::derived(base.child("sense").child("current"), source.clone(), |v| {
                v / MockSourceMeter::LOAD_OHMS
            })
            .with_unit("A"),
        );
        Self {
            name,
            source,
            sense,
            point_interval: Duration::from_millis(20),
            sweep: Mutex::new(SweepState::default()),
            pending_failures: AtomicUsize::new(0),
            fail_abort: AtomicBool::new(false),
            aborts: AtomicUsize::new(0),
        }
    }

    /// Time the buffer takes to gain one reading.
    pub fn with_point_interval(mut self, interval: Duration) -> Self {
        self.point_interval = interval;
        self
    }

    /// Source parameter.
    pub fn source(&self) -> Arc<MockParameter> {
        self.source.clone()
    }

    /// Sensed parameter.
    pub fn sense(&self) -> Arc<MockParameter> {
        self.sense.clone()
    }

    /// Make the next `n` buffer queries fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Make every abort fail, as a wedged bus would.
    pub fn fail_aborts(&self, fail: bool) {
        self.fail_abort.store(fail, Ordering::SeqCst);
    }

    /// Times `abort` was called.
    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> anyhow::Result<()> {
        let failing = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("VI_ERROR_TMO: {} did not answer", self.name);
        }
        Ok(())
    }

    fn buffered(&self, state: &SweepState) -> usize {
        if let Some(frozen) = state.frozen {
            return frozen;
        }
        match (state.range, state.started) {
            (Some(range), Some(started)) => {
                let interval = self.point_interval.as_secs_f64().max(f64::EPSILON);
                let produced = (started.elapsed().as_secs_f64() / interval) as usize;
                produced.min(range.points)
            }
            _ => 0,
        }
    }
}

impl BufferedSweepInstrument for MockSourceMeter {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure_sweep(&self, range: &SweepRange) -> anyhow::Result<()> {
        range.validate()?;
        *self.sweep.lock() = SweepState {
            range: Some(*range),
            ..SweepState::default()
        };
        debug!(instrument = %self.name, ?range, "Sweep configured");
        Ok(())
    }

    fn initiate(&self) -> anyhow::Result<()> {
        let mut state = self.sweep.lock();
        if state.range.is_none() {
            bail!("{}: no sweep configured", self.name);
        }
        state.started = Some(Instant::now());
        state.frozen = None;
        Ok(())
    }

    fn readings_count(&self) -> anyhow::Result<usize> {
        self.check_failure()?;
        let state = self.sweep.lock();
        Ok(self.buffered(&state))
    }

    fn read_buffer(&self, from: usize, to: usize) -> anyhow::Result<Vec<f64>> {
        self.check_failure()?;
        let state = self.sweep.lock();
        let range = state
            .range
            .ok_or_else(|| anyhow!("{}: no sweep configured", self.name))?;
        let available = self.buffered(&state);
        let to = to.min(available);
        let mut rng = rand::thread_rng();
        Ok((from.min(to)..to)
            .map(|i| range.value_at(i) / Self::LOAD_OHMS * (1.0 + rng.gen_range(-0.005..=0.005)))
            .collect())
    }

    fn sweep_axis(&self) -> anyhow::Result<Vec<f64>> {
        let state = self.sweep.lock();
        Ok(state.range.map(|r| r.values()).unwrap_or_default())
    }

    fn source_parameter(&self) -> ParameterId {
        self.source.id().clone()
    }

    fn sense_parameter(&self) -> ParameterId {
        self.sense.id().clone()
    }

    fn is_sweeping(&self) -> anyhow::Result<bool> {
        let state = self.sweep.lock();
        let total = state.range.map(|r| r.points).unwrap_or(0);
        Ok(state.started.is_some() && state.frozen.is_none() && self.buffered(&state) < total)
    }

    fn abort(&self) -> anyhow::Result<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        if self.fail_abort.load(Ordering::SeqCst) {
            bail!("VI_ERROR_IO: {} abort failed", self.name);
        }
        let mut state = self.sweep.lock();
        let count = self.buffered(&state);
        state.frozen = Some(count);
        Ok(())
    }
}

impl Instrument for MockSourceMeter {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> InstrumentModel {
        InstrumentModel::Keithley2450
    }

    fn parameters(&self) -> Vec<SharedParameter> {
        vec![self.source.clone(), self.sense.clone()]
    }

    fn is_busy(&self) -> anyhow::Result<bool> {
        self.is_sweeping()
    }

    fn abort(&self) -> anyhow::Result<()> {
        BufferedSweepInstrument::abort(self)
    }
}

// =============================================================================
// MockTemperatureController - Simulated Lakeshore 336
// =============================================================================

/// Four sensor channels (A-D) and two heater outputs.
///
/// Channel A tracks output 1's setpoint and channel B tracks output 2's; C and D
/// sit at their initial temperature. All readings carry a little noise.
pub struct MockTemperatureController {
    name: String,
    temperatures: Vec<Arc<MockParameter>>,
    setpoints: Vec<Arc<MockParameter>>,
}

impl MockTemperatureController {
    /// Input channels.
    pub const CHANNELS: [&'static str; 4] = ["A", "B", "C", "D"];

    /// Controller with every channel at `initial_kelvin`.
    pub fn new(name: impl Into<String>, initial_kelvin: f64) -> Self {
        let name = name.into();
        let base = ParameterId::new([name.clone()]);

        let setpoints: Vec<Arc<MockParameter>> = (1..=2)
            .map(|output| {
                Arc::new(
                    MockParameter::new(
                        base.child(format!("output_{output}")).child("setpoint"),
                        initial_kelvin,
                    )
                    .with_unit("K"),
                )
            })
            .collect();

        let temperatures = Self::CHANNELS
            .iter()
            .enumerate()
            .map(|(i, channel)| {
                let id = base.child(*channel).child("temperature");
                let param = match setpoints.get(i) {
                    Some(setpoint) => MockParameter::derived(id, setpoint.clone(), |k| k),
                    None => MockParameter::read_only(id, initial_kelvin),
                };
                Arc::new(param.with_unit("K").with_noise(0.01))
            })
            .collect();

        Self {
            name,
            temperatures,
            setpoints,
        }
    }

    /// Sensor reading parameter for channel `A`-`D`.
    pub fn temperature(&self, channel: &str) -> Option<Arc<MockParameter>> {
        let idx = Self::CHANNELS.iter().position(|c| *c == channel)?;
        self.temperatures.get(idx).cloned()
    }

    /// Heater setpoint parameter for output 1 or 2.
    pub fn setpoint(&self, output: usize) -> Option<Arc<MockParameter>> {
        self.setpoints.get(output.checked_sub(1)?).cloned()
    }
}

impl Instrument for MockTemperatureController {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> InstrumentModel {
        InstrumentModel::Lakeshore336
    }

    fn parameters(&self) -> Vec<SharedParameter> {
        self.temperatures
            .iter()
            .chain(self.setpoints.iter())
            .map(|p| p.clone() as SharedParameter)
            .collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_failures_are_consumed() {
        let p = MockParameter::new(ParameterId::new(["x"]), 2.0);
        p.fail_next_reads(2);
        assert!(p.get().is_err());
        assert!(p.get().is_err());
        assert_eq!(p.get().unwrap(), 2.0);
        assert_eq!(p.read_count(), 3);
    }

    #[test]
    fn capability_flags_are_enforced() {
        let ro = MockParameter::read_only(ParameterId::new(["t"]), 4.2);
        assert!(ro.set(1.0).is_err());
        let wo = MockParameter::write_only(ParameterId::new(["w"]));
        assert!(wo.get().is_err());
        assert!(wo.set(1.0).is_ok());
    }

    #[test]
    fn source_meter_fills_buffer_over_time() {
        let smu = MockSourceMeter::new("k2450").with_point_interval(Duration::from_millis(2));
        let range = SweepRange::new(0.0, 1.0, 5).unwrap();
        smu.configure_sweep(&range).unwrap();
        assert_eq!(smu.readings_count().unwrap(), 0);
        smu.initiate().unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(smu.readings_count().unwrap(), 5);
        assert!(!smu.is_sweeping().unwrap());
        assert_eq!(smu.read_buffer(0, 5).unwrap().len(), 5);
        assert_eq!(smu.sweep_axis().unwrap(), range.values());
        assert_eq!(smu.sense_parameter().full_name(), "k2450_sense_current");
    }

    #[test]
    fn abort_freezes_buffer() {
        let smu = MockSourceMeter::new("k2450").with_point_interval(Duration::from_secs(60));
        smu.configure_sweep(&SweepRange::new(0.0, 1.0, 5).unwrap()).unwrap();
        smu.initiate().unwrap();
        assert!(smu.is_sweeping().unwrap());
        BufferedSweepInstrument::abort(&smu).unwrap();
        assert!(!smu.is_sweeping().unwrap());
        assert_eq!(smu.abort_count(), 1);
    }

    #[test]
    fn temperature_tracks_setpoint() {
        let ls = MockTemperatureController::new("ls336", 300.0);
        ls.setpoint(1).unwrap().set(4.2).unwrap();
        let a = ls.temperature("A").unwrap().get().unwrap();
        assert!((a - 4.2).abs() < 0.05);
        assert!(ls.temperature("E").is_none());
        assert_eq!(ls.parameters().len(), 6);
    }
}

//! Integration tests for the measurement pipeline.
//!
//! Drives real measurements (setter holds, sweeps, monitors) through an
//! `ActionSequence` against an on-disk store and checks what ends up in the tables.

use peppermint::core::{ParameterId, SweepRange};
use peppermint::error::{AppResult, ConsoleError};
use peppermint::instrument::{
    MockParameter, MockSourceMeter, MockTemperatureController, SharedParameter,
};
use peppermint::measurement::{Measurement, Monitor, Setter, Sweep1D, SweepDriver};
use peppermint::sequence::{ActionSequence, SequenceState};
use peppermint::store::TimeSeriesStore;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const POLL: Duration = Duration::from_millis(5);

fn setup_store() -> (TempDir, Arc<TimeSeriesStore>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TimeSeriesStore::open(dir.path().join("session.db")).unwrap());
    (dir, store)
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(POLL);
    }
}

fn timestamps(store: &TimeSeriesStore, table: &str) -> Vec<String> {
    store
        .get_column_values(table, "timestamp")
        .unwrap()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

#[test]
fn stop_during_manual_hold_returns_to_idle() {
    let (_dir, store) = setup_store();
    let ls = MockTemperatureController::new("ls336", 300.0);
    let setpoint = ls.setpoint(1).unwrap();

    let first = Setter::new(store.clone(), "hold", setpoint.clone(), 10.0)
        .unwrap()
        .with_poll_interval(POLL);
    let second = Setter::new(store.clone(), "hold", setpoint.clone(), 20.0)
        .unwrap()
        .with_poll_interval(POLL);
    assert_eq!(first.table(), "hold");
    assert_eq!(second.table(), "hold_1");

    let sequence = ActionSequence::new(vec![Box::new(first), Box::new(second)])
        .with_poll_interval(POLL)
        .with_join_timeout(Duration::from_secs(5));
    sequence.start();

    wait_for("first hold to log", || {
        store
            .get_column_values("hold", "ls336_output_1_setpoint")
            .ok()
            .flatten()
            .is_some_and(|v| v.len() >= 3)
    });
    let (state, cursor, kind) = sequence.status();
    assert_eq!(state, SequenceState::Running);
    assert_eq!(cursor, Some(0));
    assert_eq!(kind, Some("Setter"));

    sequence.stop().unwrap();
    assert_eq!(sequence.state(), SequenceState::Idle);
    let (completed, total) = sequence.get_progress();
    assert!(completed <= 2);
    assert_eq!(total, 2);
    assert_eq!(setpoint.value(), 10.0);

    // The hold's logger is gone once stop returns.
    let rows = store.get_table_values("hold").unwrap().len();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(store.get_table_values("hold").unwrap().len(), rows);
    assert!(store.get_table_values("hold_1").unwrap().is_empty());
}

#[test]
fn sequence_runs_monitor_and_sweeps_in_order() {
    let (_dir, store) = setup_store();
    let smu = Arc::new(MockSourceMeter::new("k2450").with_point_interval(Duration::from_millis(2)));
    let ls = MockTemperatureController::new("ls336", 100.0);
    let temperature = ls.temperature("A").unwrap();
    let setpoint = ls.setpoint(1).unwrap();

    let monitor = Monitor::new(
        store.clone(),
        "monitor",
        vec![temperature.clone() as SharedParameter],
        Duration::from_millis(60),
    )
    .unwrap()
    .with_poll_interval(POLL);
    let iv = Sweep1D::new(
        store.clone(),
        "iv",
        SweepDriver::Buffered(smu.clone()),
        SweepRange::new(-1.0, 1.0, 21).unwrap(),
    )
    .unwrap()
    .with_poll_interval(POLL);
    let cooldown = Sweep1D::new(
        store.clone(),
        "cooldown",
        SweepDriver::Stepped {
            source: setpoint.clone(),
            sense: vec![temperature as SharedParameter],
            dwell: Duration::from_millis(2),
        },
        SweepRange::new(100.0, 50.0, 6).unwrap(),
    )
    .unwrap()
    .with_poll_interval(POLL);

    let sequence = ActionSequence::new(vec![Box::new(monitor), Box::new(iv), Box::new(cooldown)])
        .with_poll_interval(POLL);
    sequence.start();
    assert!(sequence.wait_for_completion(Some(Duration::from_secs(20))));

    assert_eq!(sequence.state(), SequenceState::Idle);
    assert_eq!(sequence.get_progress(), (3, 3));
    assert_eq!(sequence.status(), (SequenceState::Idle, Some(2), Some("Sweep1D")));

    assert!(!store.get_table_values("monitor").unwrap().is_empty());
    assert_eq!(store.get_table_values("iv").unwrap().len(), 21);
    let steps: Vec<f64> = store
        .get_column_values("cooldown", "ls336_output_1_setpoint")
        .unwrap()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_f64())
        .collect();
    assert_eq!(steps, vec![100.0, 90.0, 80.0, 70.0, 60.0, 50.0]);
    assert_eq!(setpoint.value(), 50.0);

    // Each table's rows were written after the previous measurement finished.
    let monitor_last = timestamps(&store, "monitor").into_iter().max().unwrap();
    let iv_times = timestamps(&store, "iv");
    let iv_first = iv_times.iter().min().unwrap().clone();
    let iv_last = iv_times.into_iter().max().unwrap();
    let cooldown_first = timestamps(&store, "cooldown").into_iter().min().unwrap();
    assert!(monitor_last <= iv_first);
    assert!(iv_last <= cooldown_first);
}

/// Fails its first activity check.
struct Faulty {
    ended: Arc<std::sync::atomic::AtomicUsize>,
}

impl Measurement for Faulty {
    fn start(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn is_active(&self) -> AppResult<bool> {
        Err(ConsoleError::instrument("VI_ERROR_CONN_LOST"))
    }

    fn end_data_collection(&mut self) {
        self.ended.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn kind(&self) -> &'static str {
        "Faulty"
    }

    fn table(&self) -> &str {
        "faulty"
    }
}

#[test]
fn failing_measurement_aborts_the_rest() {
    let (_dir, store) = setup_store();
    let ended = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let psu = Arc::new(MockParameter::new(ParameterId::new(["psu", "voltage"]), 0.0));
    let never = Setter::new(store.clone(), "never", psu.clone(), 5.0)
        .unwrap()
        .with_poll_interval(POLL);

    let sequence = ActionSequence::new(vec![
        Box::new(Faulty {
            ended: ended.clone(),
        }),
        Box::new(never),
    ])
    .with_poll_interval(POLL);
    sequence.start();
    assert!(sequence.wait_for_completion(Some(Duration::from_secs(5))));

    assert_eq!(sequence.state(), SequenceState::Error);
    assert_eq!(ended.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(sequence.get_progress(), (0, 2));
    assert_eq!(psu.value(), 0.0);
    assert!(store.get_table_values("never").unwrap().is_empty());
}

#[test]
fn pause_delays_the_next_measurement() {
    let (_dir, store) = setup_store();
    let a = Arc::new(MockParameter::new(ParameterId::new(["a"]), 0.0));
    let b = Arc::new(MockParameter::new(ParameterId::new(["b"]), 0.0));
    let first = Monitor::new(
        store.clone(),
        "first",
        vec![a as SharedParameter],
        Duration::from_millis(100),
    )
    .unwrap()
    .with_poll_interval(POLL);
    let second = Monitor::new(
        store.clone(),
        "second",
        vec![b as SharedParameter],
        Duration::from_millis(20),
    )
    .unwrap()
    .with_poll_interval(POLL);

    let sequence = ActionSequence::new(vec![Box::new(first), Box::new(second)])
        .with_poll_interval(POLL);
    sequence.start();
    wait_for("first monitor", || sequence.status().1 == Some(0));
    sequence.pause();
    assert_eq!(sequence.state(), SequenceState::Paused);

    // The running monitor finishes on its own; the next one waits at the gate.
    thread::sleep(Duration::from_millis(250));
    assert_eq!(sequence.get_progress(), (1, 2));
    assert!(store.get_table_values("second").unwrap().is_empty());

    sequence.resume();
    assert!(sequence.wait_for_completion(Some(Duration::from_secs(5))));
    assert_eq!(sequence.get_progress(), (2, 2));
    assert!(!store.get_table_values("second").unwrap().is_empty());
}

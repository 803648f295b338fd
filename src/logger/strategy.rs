//! Continuation policies for [`ContinuousLogger`](super::ContinuousLogger).
//!
//! A strategy is asked once per poll tick whether logging should go on. It owns
//! nothing but its own counters and is cleaned up exactly once when the poll loop
//! exits, however it exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-tick continuation predicate.
pub trait LoggingStrategy: Send {
    /// Checked once per tick; false ends the run.
    fn should_continue_logging(&mut self) -> bool;

    /// Runs once after the last tick.
    fn cleanup(&mut self) {}

    /// Whether the logger should poll the source one final time after this strategy
    /// reports exhaustion. Producers that pace themselves (hardware buffers) can
    /// finish between the last poll and the exhaustion check.
    fn drains_on_exhaustion(&self) -> bool {
        false
    }

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Logs until [`ManualStopHandle::stop`] is called.
pub struct ManualStop {
    stopped: Arc<AtomicBool>,
}

/// Clonable remote control for a [`ManualStop`] strategy.
#[derive(Clone, Debug)]
pub struct ManualStopHandle {
    stopped: Arc<AtomicBool>,
}

impl ManualStop {
    /// Strategy plus the handle that stops it.
    pub fn new() -> (Self, ManualStopHandle) {
        let stopped = Arc::new(AtomicBool::new(false));
        (
            Self {
                stopped: stopped.clone(),
            },
            ManualStopHandle { stopped },
        )
    }
}

impl ManualStopHandle {
    /// Request a stop.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LoggingStrategy for ManualStop {
    fn should_continue_logging(&mut self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    fn cleanup(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

/// Logs until a wall-clock deadline fixed at construction.
pub struct TimeBoxed {
    deadline: Instant,
}

impl TimeBoxed {
    /// Run for `duration` from the first tick.
    pub fn new(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
        }
    }

    /// Time left, zero before the first tick.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

impl LoggingStrategy for TimeBoxed {
    fn should_continue_logging(&mut self) -> bool {
        Instant::now() < self.deadline
    }

    fn name(&self) -> &'static str {
        "time-boxed"
    }
}

type Counter = Box<dyn FnMut() -> anyhow::Result<usize> + Send>;

/// Logs while an external counter stays below an expected total.
///
/// Used for hardware-paced sweeps, where the counter is the instrument's sample
/// buffer depth. A failed counter read is treated as transient: logging continues
/// and the counter is asked again next tick.
pub struct BoundedCount {
    counter: Counter,
    expected: usize,
    last_seen: usize,
}

impl BoundedCount {
    /// Run until `counter` reports `expected` items.
    pub fn new<F>(expected: usize, counter: F) -> Self
    where
        F: FnMut() -> anyhow::Result<usize> + Send + 'static,
    {
        Self {
            counter: Box::new(counter),
            expected,
            last_seen: 0,
        }
    }

    /// Target count.
    pub fn expected(&self) -> usize {
        self.expected
    }
}

impl LoggingStrategy for BoundedCount {
    fn should_continue_logging(&mut self) -> bool {
        match (self.counter)() {
            Ok(count) => {
                self.last_seen = count;
                count < self.expected
            }
            Err(e) => {
                warn!("Buffer count read failed, continuing: {e:#}");
                true
            }
        }
    }

    fn cleanup(&mut self) {
        debug!(
            seen = self.last_seen,
            expected = self.expected,
            "Bounded-count logging finished"
        );
    }

    fn drains_on_exhaustion(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "bounded-count"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_stop_follows_handle() {
        let (mut strategy, handle) = ManualStop::new();
        assert!(strategy.should_continue_logging());
        handle.stop();
        assert!(!strategy.should_continue_logging());
        assert!(handle.is_stopped());
    }

    #[test]
    fn time_boxed_expires() {
        let mut strategy = TimeBoxed::new(Duration::from_millis(20));
        assert!(strategy.should_continue_logging());
        std::thread::sleep(Duration::from_millis(30));
        assert!(!strategy.should_continue_logging());
        assert_eq!(strategy.remaining(), Duration::ZERO);
    }

    #[test]
    fn bounded_count_tolerates_counter_errors() {
        let mut reads = vec![Ok(0), Err(anyhow::anyhow!("timeout")), Ok(2), Ok(3)].into_iter();
        let mut strategy = BoundedCount::new(3, move || reads.next().unwrap_or(Ok(3)));
        assert!(strategy.should_continue_logging());
        assert!(strategy.should_continue_logging());
        assert!(strategy.should_continue_logging());
        assert!(!strategy.should_continue_logging());
        assert!(strategy.drains_on_exhaustion());
    }
}

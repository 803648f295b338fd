//! Blocking primitives shared by the worker threads.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A boolean flag that waiters can block on with a timeout.
#[derive(Default)]
pub(crate) struct Signal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn set(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn reset(&self) {
        *self.set.lock() = false;
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Block until set or until `timeout` elapses. Returns whether it is set.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                break;
            }
        }
        *set
    }

    /// Block until set.
    pub(crate) fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }
}

/// A gate threads pass through while open and block at while closed.
pub(crate) struct Gate {
    open: Signal,
}

impl Default for Gate {
    fn default() -> Self {
        let gate = Self {
            open: Signal::default(),
        };
        gate.open();
        gate
    }
}

impl Gate {
    pub(crate) fn open(&self) {
        self.open.set();
    }

    pub(crate) fn close(&self) {
        self.open.reset();
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.is_set()
    }

    pub(crate) fn pass(&self) {
        self.open.wait();
    }
}

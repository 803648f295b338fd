//! The render loop: the one thread allowed to touch chart state.
//!
//! Watcher and timer threads never mutate a chart directly; they schedule closures
//! through a [`RenderHandle`] and whoever owns the [`RenderLoop`] runs them in order.

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::debug;

type RenderTask = Box<dyn FnOnce() + Send>;

/// Receiving end, owned by the rendering thread.
pub struct RenderLoop {
    rx: UnboundedReceiver<RenderTask>,
}

/// Clonable scheduling end.
#[derive(Clone)]
pub struct RenderHandle {
    tx: UnboundedSender<RenderTask>,
}

impl RenderLoop {
    /// Render queue plus the handle producers post onto.
    pub fn new() -> (Self, RenderHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, RenderHandle { tx })
    }

    /// Run everything scheduled so far without blocking. Returns the task count.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        loop {
            match self.rx.try_recv() {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        ran
    }

    /// Block running tasks until every handle has been dropped.
    ///
    /// Must not be called from inside an async runtime.
    pub fn run_until_closed(mut self) {
        while let Some(task) = self.rx.blocking_recv() {
            task();
        }
        debug!("Render loop closed");
    }
}

impl RenderHandle {
    /// Queue `task` for the render thread. Returns `false` if the loop is gone.
    pub fn schedule<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let scheduled = self.tx.send(Box::new(task)).is_ok();
        if !scheduled {
            debug!("Render loop gone, dropping update");
        }
        scheduled
    }
}

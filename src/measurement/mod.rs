//! Measurements: units of work an [`ActionSequence`](crate::sequence::ActionSequence)
//! runs one at a time.
//!
//! A measurement kicks off instrument activity in [`Measurement::start`] and returns
//! immediately. It owns one [`ContinuousLogger`](crate::logger::ContinuousLogger)
//! that moves new readings into its table, and stays active until both the
//! instrument and the logger are done.

use tracing::warn;

use crate::error::{AppResult, ConsoleError};
use crate::instrument::Parameter;
use crate::logger::ContinuousLogger;

pub mod monitor;
pub mod setter;
pub mod sweep;

pub use monitor::Monitor;
pub use setter::Setter;
pub use sweep::{Sweep1D, SweepDriver};

/// A unit of work in a sequence.
pub trait Measurement: Send {
    /// Kick off the instrument operation and logging. Must not block past kick-off.
    fn start(&mut self) -> AppResult<()>;

    /// `true` while the instrument reports outstanding work or the logger is still
    /// draining.
    fn is_active(&self) -> AppResult<bool>;

    /// Abort the instrument and stop logging. Safe to call repeatedly and on a
    /// measurement that already finished; failures are logged, not returned.
    fn end_data_collection(&mut self);

    /// Short type name shown in sequence status.
    fn kind(&self) -> &'static str;

    /// Table this measurement writes to.
    fn table(&self) -> &str;
}

pub(crate) fn require_gettable(parameter: &dyn Parameter) -> AppResult<()> {
    if parameter.gettable() {
        Ok(())
    } else {
        Err(ConsoleError::ParameterNotGettable(parameter.full_name()))
    }
}

pub(crate) fn require_settable(parameter: &dyn Parameter) -> AppResult<()> {
    if parameter.settable() {
        Ok(())
    } else {
        Err(ConsoleError::ParameterNotSettable(parameter.full_name()))
    }
}

/// Stop a measurement's logger, logging rather than returning a timeout.
pub(crate) fn stop_logger(logger: &ContinuousLogger, kind: &str) {
    if let Err(e) = logger.stop_logging() {
        warn!(measurement = kind, table = logger.table(), "Failed to stop logger: {e}");
    }
}

//! Continuous logging: strategies and the poll loop.

mod continuous;
mod strategy;

pub use continuous::{ContinuousLogger, DataSource};
pub use strategy::{BoundedCount, LoggingStrategy, ManualStop, ManualStopHandle, TimeBoxed};

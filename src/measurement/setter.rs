//! Set-and-hold: drive a parameter to a value and log it until told to stop.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{require_gettable, require_settable, stop_logger, Measurement};
use crate::core::{DataPoint, Row};
use crate::error::{AppResult, ConsoleError};
use crate::instrument::{Parameter, SharedParameter};
use crate::logger::{ContinuousLogger, ManualStop, ManualStopHandle};
use crate::store::TimeSeriesStore;

/// Holds a settable parameter at a value and logs its readback.
///
/// Uses a manual-stop strategy, so in a sequence it stays active until the
/// sequence is stopped or [`Setter::release`] is called.
pub struct Setter {
    parameter: SharedParameter,
    value: f64,
    logger: ContinuousLogger,
    hold: Option<ManualStopHandle>,
}

impl Setter {
    /// Validates the parameter and registers a table for the hold.
    pub fn new(
        store: Arc<TimeSeriesStore>,
        table: &str,
        parameter: SharedParameter,
        value: f64,
    ) -> AppResult<Self> {
        require_settable(parameter.as_ref())?;
        require_gettable(parameter.as_ref())?;
        let table = store.register_table(table)?;
        Ok(Self {
            parameter,
            value,
            logger: ContinuousLogger::new(store, table),
            hold: None,
        })
    }

    /// Set how often readings are taken while holding.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.logger = self.logger.with_interval(interval);
        self
    }

    /// Change the held value while logging continues.
    pub fn set_value(&mut self, value: f64) -> AppResult<()> {
        self.parameter
            .set(value)
            .map_err(|e| ConsoleError::instrument(format!("{e:#}")))?;
        self.value = value;
        Ok(())
    }

    /// Target value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// End the hold; the logger exits on its next tick.
    pub fn release(&self) {
        if let Some(hold) = &self.hold {
            hold.stop();
        }
    }
}

impl Measurement for Setter {
    fn start(&mut self) -> AppResult<()> {
        self.parameter
            .set(self.value)
            .map_err(|e| ConsoleError::instrument(format!("{e:#}")))?;
        info!(parameter = %self.parameter.full_name(), value = self.value, "Holding setpoint");

        let (strategy, hold) = ManualStop::new();
        let parameter = self.parameter.clone();
        let name = parameter.full_name();
        self.logger.start_logging(
            move || -> anyhow::Result<Vec<Row>> {
                Ok(vec![vec![DataPoint::new(name.clone(), parameter.get()?)]])
            },
            strategy,
        )?;
        self.hold = Some(hold);
        Ok(())
    }

    fn is_active(&self) -> AppResult<bool> {
        Ok(self.logger.is_logging())
    }

    fn end_data_collection(&mut self) {
        if let Some(hold) = self.hold.take() {
            hold.stop();
        }
        stop_logger(&self.logger, self.kind());
    }

    fn kind(&self) -> &'static str {
        "Setter"
    }

    fn table(&self) -> &str {
        self.logger.table()
    }
}

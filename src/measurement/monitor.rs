//! Time-boxed monitoring of a set of readable parameters.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{require_gettable, stop_logger, Measurement};
use crate::core::{DataPoint, Row};
use crate::error::{AppResult, ConsoleError};
use crate::instrument::{Parameter, SharedParameter};
use crate::logger::{ContinuousLogger, TimeBoxed};
use crate::store::TimeSeriesStore;

/// Logs every parameter once per tick, as one row, for a fixed duration.
pub struct Monitor {
    parameters: Vec<SharedParameter>,
    duration: Duration,
    logger: ContinuousLogger,
}

impl Monitor {
    /// Monitor reading `parameters` into `table` for `duration`.
    pub fn new(
        store: Arc<TimeSeriesStore>,
        table: &str,
        parameters: Vec<SharedParameter>,
        duration: Duration,
    ) -> AppResult<Self> {
        if parameters.is_empty() {
            return Err(ConsoleError::Configuration(
                "monitor needs at least one parameter".to_string(),
            ));
        }
        for parameter in &parameters {
            require_gettable(parameter.as_ref())?;
        }
        let table = store.register_table(table)?;
        Ok(Self {
            parameters,
            duration,
            logger: ContinuousLogger::new(store, table),
        })
    }

    /// Set the sampling period.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.logger = self.logger.with_interval(interval);
        self
    }

    /// How long the monitor runs.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// One row with every parameter that answered. Fails only if none did.
fn read_all(parameters: &[SharedParameter]) -> anyhow::Result<Vec<Row>> {
    let mut row = Vec::with_capacity(parameters.len());
    let mut last_error = None;
    for parameter in parameters {
        match parameter.get() {
            Ok(value) => row.push(DataPoint::new(parameter.full_name(), value)),
            Err(e) => {
                debug!(parameter = %parameter.full_name(), "Read failed: {e:#}");
                last_error = Some(e);
            }
        }
    }
    match (row.is_empty(), last_error) {
        (true, Some(e)) => Err(e),
        _ => Ok(vec![row]),
    }
}

impl Measurement for Monitor {
    fn start(&mut self) -> AppResult<()> {
        let parameters = self.parameters.clone();
        self.logger
            .start_logging(move || read_all(&parameters), TimeBoxed::new(self.duration))
    }

    fn is_active(&self) -> AppResult<bool> {
        Ok(self.logger.is_logging())
    }

    fn end_data_collection(&mut self) {
        stop_logger(&self.logger, self.kind());
    }

    fn kind(&self) -> &'static str {
        "Monitor"
    }

    fn table(&self) -> &str {
        self.logger.table()
    }
}

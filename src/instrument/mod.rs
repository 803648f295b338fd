//! Instrument boundary.
//!
//! The console never talks to a bus directly. Drivers expose named [`Parameter`]s
//! with `get`/`set` and capability flags, and instruments that can run a
//! hardware-paced sweep additionally implement [`BufferedSweepInstrument`].
//! [`InstrumentModel`] is the closed set of models the console knows how to drive;
//! it is identified from a `*IDN?` reply and decides which sweep driver applies.
//!
//! All calls here may block for a device timeout. Only poll and worker threads
//! should make them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::core::{ParameterId, SweepRange};

pub mod mock;

pub use mock::{MockParameter, MockSourceMeter, MockTemperatureController};

/// A named value on an instrument.
pub trait Parameter: Send + Sync {
    /// Stable identity, also the store column name.
    fn id(&self) -> &ParameterId;

    /// Column name used when this parameter is logged.
    fn full_name(&self) -> String {
        self.id().full_name()
    }

    /// Unit label, empty when dimensionless.
    fn unit(&self) -> &str {
        ""
    }

    /// Whether `get` is supported.
    fn gettable(&self) -> bool;
    /// Whether `set` is supported.
    fn settable(&self) -> bool;

    /// Read the current value.
    fn get(&self) -> anyhow::Result<f64>;
    /// Write a new value.
    fn set(&self, value: f64) -> anyhow::Result<()>;
}

/// Parameter shared across threads.
pub type SharedParameter = Arc<dyn Parameter>;

/// A connected instrument.
pub trait Instrument: Send + Sync {
    /// Unique instrument name.
    fn name(&self) -> &str;

    /// Model of the instrument.
    fn model(&self) -> InstrumentModel;

    /// Every parameter the instrument exposes.
    fn parameters(&self) -> Vec<SharedParameter>;

    /// Look up a parameter by full name.
    fn parameter(&self, full_name: &str) -> Option<SharedParameter> {
        self.parameters()
            .into_iter()
            .find(|p| p.full_name() == full_name)
    }

    /// Whether the instrument still reports outstanding work.
    fn is_busy(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Abort any running operation and return to a safe idle state.
    fn abort(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Instrument shared across threads.
pub type SharedInstrument = Arc<dyn Instrument>;

/// An instrument that runs a sweep itself and buffers the readings.
///
/// The console configures and initiates the sweep, then drains the buffer while
/// the instrument paces itself.
pub trait BufferedSweepInstrument: Send + Sync {
    /// Instrument name.
    fn name(&self) -> &str;

    /// Load the sweep into the instrument.
    fn configure_sweep(&self, range: &SweepRange) -> anyhow::Result<()>;

    /// Start the configured sweep.
    fn initiate(&self) -> anyhow::Result<()>;

    /// Readings currently held in the buffer.
    fn readings_count(&self) -> anyhow::Result<usize>;

    /// Buffered readings `[from, to)`.
    fn read_buffer(&self, from: usize, to: usize) -> anyhow::Result<Vec<f64>>;

    /// Source setpoints of the configured sweep, one per reading.
    fn sweep_axis(&self) -> anyhow::Result<Vec<f64>>;

    /// Parameter being swept.
    fn source_parameter(&self) -> ParameterId;
    /// Parameter being measured.
    fn sense_parameter(&self) -> ParameterId;

    /// Whether the sweep is still running.
    fn is_sweeping(&self) -> anyhow::Result<bool>;

    /// Stop a sweep in progress.
    fn abort(&self) -> anyhow::Result<()>;
}

/// How a model can be swept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepCapability {
    /// Instrument-paced sweep into an on-board buffer.
    Buffered,
    /// Software steps a settable parameter.
    Stepped,
    /// Read-only; can be monitored but not swept.
    MonitorOnly,
}

/// Instrument models the console can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentModel {
    /// Keithley 2450 source meter.
    Keithley2450,
    /// Lakeshore 336 temperature controller.
    Lakeshore336,
    /// Cryomagnetics 4G magnet supply.
    Cryomagnetics4G,
    /// TM620 temperature monitor.
    Tm620,
    /// In-process mock.
    Simulated,
}

impl InstrumentModel {
    /// Identify a model from a `*IDN?` reply.
    ///
    /// The reply is `manufacturer,model,serial,firmware`; only the model field is
    /// inspected.
    pub fn from_idn(idn: &str) -> Option<Self> {
        let model = idn.split(',').nth(1)?.trim();
        match model {
            "MODEL 2450" => Some(Self::Keithley2450),
            "MODEL336" => Some(Self::Lakeshore336),
            "4G" => Some(Self::Cryomagnetics4G),
            m if m.contains("TM620") => Some(Self::Tm620),
            _ => None,
        }
    }

    /// Name given to a freshly connected instrument of this model.
    pub fn default_name(&self) -> &'static str {
        match self {
            Self::Keithley2450 => "k2450",
            Self::Lakeshore336 => "ls336",
            Self::Cryomagnetics4G => "cryo4g",
            Self::Tm620 => "tm620",
            Self::Simulated => "sim",
        }
    }

    /// How this model can be swept.
    pub fn sweep_capability(&self) -> SweepCapability {
        match self {
            Self::Keithley2450 => SweepCapability::Buffered,
            Self::Lakeshore336 | Self::Cryomagnetics4G | Self::Simulated => {
                SweepCapability::Stepped
            }
            Self::Tm620 => SweepCapability::MonitorOnly,
        }
    }
}

impl fmt::Display for InstrumentModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Keithley2450 => "Keithley 2450",
            Self::Lakeshore336 => "Lakeshore 336",
            Self::Cryomagnetics4G => "Cryomagnetics 4G",
            Self::Tm620 => "TM620",
            Self::Simulated => "Simulated",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifies_models_from_idn() {
        assert_eq!(
            InstrumentModel::from_idn("KEITHLEY INSTRUMENTS,MODEL 2450,04096331,1.7.12b"),
            Some(InstrumentModel::Keithley2450)
        );
        assert_eq!(
            InstrumentModel::from_idn("LSCI,MODEL336,1234567,1.0"),
            Some(InstrumentModel::Lakeshore336)
        );
        assert_eq!(
            InstrumentModel::from_idn("Cryomagnetics, 4G ,1234,1.0"),
            Some(InstrumentModel::Cryomagnetics4G)
        );
        assert_eq!(InstrumentModel::from_idn("ACME,WIDGET,1,1"), None);
        assert_eq!(InstrumentModel::from_idn("garbage"), None);
    }

    #[test]
    fn model_selects_sweep_driver() {
        assert_eq!(
            InstrumentModel::Keithley2450.sweep_capability(),
            SweepCapability::Buffered
        );
        assert_eq!(
            InstrumentModel::Tm620.sweep_capability(),
            SweepCapability::MonitorOnly
        );
        assert_eq!(InstrumentModel::Lakeshore336.default_name(), "ls336");
    }
}

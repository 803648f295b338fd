//! Console-wide shared state.
//!
//! One [`ConsoleState`] is built at startup and handed around by `Arc`. It owns the
//! store, the connected instruments and the operator's read/write parameter
//! selections. Every mutation publishes a [`StateEvent`] so views can refresh
//! without polling the lists.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::ConsoleConfig;
use crate::error::{AppResult, ConsoleError};
use crate::instrument::{Instrument, Parameter, SharedInstrument, SharedParameter};
use crate::store::TimeSeriesStore;

const EVENT_CAPACITY: usize = 64;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// Detected resources were replaced.
    ResourcesChanged,
    /// An instrument was added or removed.
    InstrumentsChanged,
    /// The read parameter list changed.
    ReadParametersChanged,
    /// The write parameter list changed.
    WriteParametersChanged,
}

/// Shared application state: instruments, selected parameters and the store.
pub struct ConsoleState {
    config: ConsoleConfig,
    store: Arc<TimeSeriesStore>,
    detected_resources: RwLock<Vec<String>>,
    instruments: RwLock<Vec<SharedInstrument>>,
    read_parameters: RwLock<Vec<SharedParameter>>,
    write_parameters: RwLock<Vec<SharedParameter>>,
    events: broadcast::Sender<StateEvent>,
}

impl ConsoleState {
    /// State over `store`, with no instruments.
    pub fn new(config: ConsoleConfig, store: Arc<TimeSeriesStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            store,
            detected_resources: RwLock::new(Vec::new()),
            instruments: RwLock::new(Vec::new()),
            read_parameters: RwLock::new(Vec::new()),
            write_parameters: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Open the configured store and build the state around it.
    pub fn from_config(config: ConsoleConfig) -> AppResult<Self> {
        let store = Arc::new(TimeSeriesStore::from_config(&config.storage)?);
        Ok(Self::new(config, store))
    }

    /// Loaded configuration.
    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    /// Shared store handle.
    pub fn store(&self) -> Arc<TimeSeriesStore> {
        self.store.clone()
    }

    /// Receiver for subsequent [`StateEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StateEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
        debug!(?event, "State changed");
    }

    /// Replace the detected resource list.
    pub fn set_detected_resources(&self, resources: Vec<String>) {
        *self.detected_resources.write() = resources;
        self.publish(StateEvent::ResourcesChanged);
    }

    /// Resources seen by the last scan.
    pub fn detected_resources(&self) -> Vec<String> {
        self.detected_resources.read().clone()
    }

    /// Add a connected instrument. Names must be unique.
    pub fn connect_instrument(&self, instrument: SharedInstrument) -> AppResult<()> {
        {
            let mut instruments = self.instruments.write();
            if instruments.iter().any(|i| i.name() == instrument.name()) {
                return Err(ConsoleError::Configuration(format!(
                    "instrument '{}' is already connected",
                    instrument.name()
                )));
            }
            info!(name = instrument.name(), model = %instrument.model(), "Instrument connected");
            instruments.push(instrument);
        }
        self.publish(StateEvent::InstrumentsChanged);
        Ok(())
    }

    /// Remove an instrument and drop its parameters from both selections.
    pub fn disconnect_instrument(&self, name: &str) -> Option<SharedInstrument> {
        let removed = {
            let mut instruments = self.instruments.write();
            let index = instruments.iter().position(|i| i.name() == name)?;
            instruments.remove(index)
        };
        let owned = |p: &SharedParameter| p.id().instrument() == name;
        let read_changed = retain_changed(&self.read_parameters, |p| !owned(p));
        let write_changed = retain_changed(&self.write_parameters, |p| !owned(p));

        info!(name, "Instrument disconnected");
        self.publish(StateEvent::InstrumentsChanged);
        if read_changed {
            self.publish(StateEvent::ReadParametersChanged);
        }
        if write_changed {
            self.publish(StateEvent::WriteParametersChanged);
        }
        Some(removed)
    }

    /// Connected instruments.
    pub fn instruments(&self) -> Vec<SharedInstrument> {
        self.instruments.read().clone()
    }

    /// Instrument by name.
    pub fn find_instrument(&self, name: &str) -> Option<SharedInstrument> {
        self.instruments
            .read()
            .iter()
            .find(|i| i.name() == name)
            .cloned()
    }

    /// Look up a parameter on any connected instrument by full name.
    pub fn find_parameter(&self, full_name: &str) -> Option<SharedParameter> {
        self.instruments
            .read()
            .iter()
            .find_map(|i| i.parameter(full_name))
    }

    /// Mark a parameter for logging. Returns `false` if it was already marked.
    pub fn add_read_parameter(&self, parameter: SharedParameter) -> AppResult<bool> {
        if !parameter.gettable() {
            return Err(ConsoleError::ParameterNotGettable(parameter.full_name()));
        }
        let added = insert_unique(&self.read_parameters, parameter);
        if added {
            self.publish(StateEvent::ReadParametersChanged);
        }
        Ok(added)
    }

    /// Mark a parameter for setting. Returns `false` if it was already marked.
    pub fn add_write_parameter(&self, parameter: SharedParameter) -> AppResult<bool> {
        if !parameter.settable() {
            return Err(ConsoleError::ParameterNotSettable(parameter.full_name()));
        }
        let added = insert_unique(&self.write_parameters, parameter);
        if added {
            self.publish(StateEvent::WriteParametersChanged);
        }
        Ok(added)
    }

    /// Drop a read parameter. Returns whether it was present.
    pub fn remove_read_parameter(&self, full_name: &str) -> bool {
        let removed = retain_changed(&self.read_parameters, |p| p.full_name() != full_name);
        if removed {
            self.publish(StateEvent::ReadParametersChanged);
        }
        removed
    }

    /// Drop a write parameter. Returns whether it was present.
    pub fn remove_write_parameter(&self, full_name: &str) -> bool {
        let removed = retain_changed(&self.write_parameters, |p| p.full_name() != full_name);
        if removed {
            self.publish(StateEvent::WriteParametersChanged);
        }
        removed
    }

    /// Parameters selected for reading.
    pub fn read_parameters(&self) -> Vec<SharedParameter> {
        self.read_parameters.read().clone()
    }

    /// Parameters selected for writing.
    pub fn write_parameters(&self) -> Vec<SharedParameter> {
        self.write_parameters.read().clone()
    }
}

fn insert_unique(list: &RwLock<Vec<SharedParameter>>, parameter: SharedParameter) -> bool {
    let mut list = list.write();
    let name = parameter.full_name();
    if list.iter().any(|p| p.full_name() == name) {
        return false;
    }
    list.push(parameter);
    true
}

fn retain_changed(
    list: &RwLock<Vec<SharedParameter>>,
    keep: impl Fn(&SharedParameter) -> bool,
) -> bool {
    let mut list = list.write();
    let before = list.len();
    list.retain(|p| keep(p));
    list.len() != before
}

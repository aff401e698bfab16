pub mod assist;
pub mod config;
pub mod device;
pub mod policy;
pub mod power;
pub mod status;
pub mod store;
pub mod thermostat;
pub mod topics;
pub mod trend;
pub mod types;

pub use config::{
    ConfigError, ControllerConfig, DeviceConfig, GlobalConfig, NetworkConfig, PowerConfig,
    RuntimeConfig, ThermostatSettings,
};
pub use device::DeviceCommand;
pub use status::{ControllerStatus, DeviceStatus, ThermalSummary};
pub use store::{StoreError, TimerRecord, TimerRecords, TimerStore};
pub use thermostat::{ControlError, ManualToggle, Observation, ThermostatEngine};
pub use topics::*;
pub use types::{DeviceBehavior, DeviceRole, HvacMode, Preset};

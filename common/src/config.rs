use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DeviceRole, HvacMode, Preset};

pub const LOWER_OFFSET_RANGE: (f64, f64) = (-5.0, 0.0);
pub const UPPER_OFFSET_RANGE: (f64, f64) = (0.0, 5.0);

pub const DEFAULT_PRIMARY_OFFSETS: Offsets = Offsets {
    lower: -0.3,
    upper: 1.5,
};
pub const DEFAULT_ASSIST_OFFSETS: Offsets = Offsets {
    lower: -4.0,
    upper: 4.0,
};

pub const MIN_TARGET_TEMPERATURE: f64 = 10.0;
pub const MAX_TARGET_TEMPERATURE: f64 = 30.0;
pub const DEFAULT_TARGET_TEMPERATURE: f64 = 21.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("device {device}: {field} offset {value} outside {min}..={max}")]
    OffsetOutOfRange {
        device: String,
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("min_setpoint {min} must be below max_setpoint {max}")]
    SetpointRange { min: f64, max: f64 },
    #[error("off ETA threshold {off} min must be below on ETA threshold {on} min")]
    EtaThresholdsInverted { on: f64, off: f64 },
    #[error("{0} must be finite")]
    NotFinite(&'static str),
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("{0} must not be negative")]
    Negative(&'static str),
    #[error("at least one room sensor is required")]
    NoRoomSensors,
    #[error("{0} must not be empty")]
    EmptyIdentifier(&'static str),
    #[error("device id {0} is configured more than once")]
    DuplicateDevice(String),
    #[error("entity {0} is bound more than once")]
    DuplicateEntity(String),
    #[error("only one primary device may be configured")]
    MultiplePrimaries,
    #[error("device {0}: water sensor is only supported on the primary")]
    WaterSensorOnAssist(String),
    #[error("device {0}: automatic on/off control is only supported on assists")]
    OnOffControlOnPrimary(String),
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Lower and upper setpoint offsets relative to the sensed temperature, in °C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Offsets {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub room_sensors: Vec<String>,
    pub min_setpoint: f64,
    pub max_setpoint: f64,
    pub assist_timer_ms: u64,
    pub on_eta_threshold_min: f64,
    pub off_eta_threshold_min: f64,
    pub min_on_ms: u64,
    pub min_off_ms: u64,
    pub water_on_threshold_c: f64,
    pub stall_delta_c: f64,
    pub net_power_sensor: Option<String>,
    pub sensor_stale_timeout_ms: u64,
    pub room_window_ms: u64,
    pub water_window_ms: u64,
    pub device_window_ms: u64,
    pub tick_interval_ms: u64,
    pub state_publish_interval_ms: u64,
    /// Minimum spacing between two commands of the same kind to one entity.
    pub command_cooldown_ms: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            room_sensors: Vec::new(),
            min_setpoint: 16.0,
            max_setpoint: 30.0,
            assist_timer_ms: 300_000,
            on_eta_threshold_min: 60.0,
            off_eta_threshold_min: 15.0,
            min_on_ms: 1_200_000,
            min_off_ms: 600_000,
            water_on_threshold_c: 40.0,
            stall_delta_c: 0.5,
            net_power_sensor: None,
            sensor_stale_timeout_ms: 900_000,
            room_window_ms: 900_000,
            water_window_ms: 600_000,
            device_window_ms: 900_000,
            tick_interval_ms: 30_000,
            state_publish_interval_ms: 10_000,
            command_cooldown_ms: 20_000,
        }
    }
}

impl GlobalConfig {
    /// Upper bound for a condition timer that keeps accumulating while the
    /// anti-short-cycle guard holds a transition back.
    pub fn condition_timer_cap_ms(&self) -> u64 {
        self.assist_timer_ms
            .saturating_add(self.min_on_ms.max(self.min_off_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Export kept back from the allocator, in watts.
    pub reserve_w: f64,
    pub min_budget_w: f64,
    pub primary_max_increment_w: f64,
    pub assist_max_increment_w: f64,
    pub adjust_interval_ms: u64,
    pub deadband_pct: f64,
    pub step_c: f64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            reserve_w: 300.0,
            min_budget_w: 200.0,
            primary_max_increment_w: 1_200.0,
            assist_max_increment_w: 1_200.0,
            adjust_interval_ms: 90_000,
            deadband_pct: 15.0,
            step_c: 0.3,
        }
    }
}

impl PowerConfig {
    pub fn max_increment_w(&self, role: DeviceRole) -> f64 {
        match role {
            DeviceRole::Primary => self.primary_max_increment_w,
            DeviceRole::Assist => self.assist_max_increment_w,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: DeviceRole,
    pub climate_entity: String,
    #[serde(default)]
    pub power_sensor: Option<String>,
    #[serde(default)]
    pub water_sensor: Option<String>,
    #[serde(default)]
    pub lower_offset: Option<f64>,
    #[serde(default)]
    pub upper_offset: Option<f64>,
    #[serde(default)]
    pub allow_on_off_control: bool,
    /// A setpoint the user changes on the device itself becomes the
    /// thermostat target.
    #[serde(default)]
    pub copy_setpoint_to_thermostat: bool,
}

impl DeviceConfig {
    pub fn new(id: &str, role: DeviceRole, climate_entity: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            role,
            climate_entity: climate_entity.to_string(),
            power_sensor: None,
            water_sensor: None,
            lower_offset: None,
            upper_offset: None,
            allow_on_off_control: false,
            copy_setpoint_to_thermostat: false,
        }
    }

    pub fn offsets(&self) -> Offsets {
        let defaults = match self.role {
            DeviceRole::Primary => DEFAULT_PRIMARY_OFFSETS,
            DeviceRole::Assist => DEFAULT_ASSIST_OFFSETS,
        };
        Offsets {
            lower: self.lower_offset.unwrap_or(defaults.lower),
            upper: self.upper_offset.unwrap_or(defaults.upper),
        }
    }

    /// Automatic on/off applies only to assists that opted in.
    pub fn is_automatic(&self) -> bool {
        self.role == DeviceRole::Assist && self.allow_on_off_control
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => display_name_from_entity(&self.climate_entity),
        }
    }
}

/// `climate.living_room_hp` becomes `Living Room Hp`.
pub fn display_name_from_entity(entity_id: &str) -> String {
    let object_id = entity_id
        .split_once('.')
        .map(|(_, rest)| rest)
        .unwrap_or(entity_id);
    object_id
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// What a given entity id feeds into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityBinding {
    RoomSensor,
    NetPower,
    DeviceClimate(String),
    DevicePower(String),
    WaterSensor(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub global: GlobalConfig,
    pub power: PowerConfig,
    pub devices: Vec<DeviceConfig>,
}

impl ControllerConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|device| device.id == device_id)
    }

    pub fn primary(&self) -> Option<&DeviceConfig> {
        self.devices
            .iter()
            .find(|device| device.role == DeviceRole::Primary)
    }

    /// Devices in control priority order: the primary first, then assists in
    /// configuration order.
    pub fn ordered_devices(&self) -> Vec<DeviceConfig> {
        let mut ordered: Vec<DeviceConfig> = self.primary().cloned().into_iter().collect();
        ordered.extend(
            self.devices
                .iter()
                .filter(|device| device.role == DeviceRole::Assist)
                .cloned(),
        );
        ordered
    }

    pub fn binding(&self, entity_id: &str) -> Option<EntityBinding> {
        if self.global.room_sensors.iter().any(|id| id == entity_id) {
            return Some(EntityBinding::RoomSensor);
        }
        if self.global.net_power_sensor.as_deref() == Some(entity_id) {
            return Some(EntityBinding::NetPower);
        }
        self.devices.iter().find_map(|device| {
            if device.climate_entity == entity_id {
                Some(EntityBinding::DeviceClimate(device.id.clone()))
            } else if device.power_sensor.as_deref() == Some(entity_id) {
                Some(EntityBinding::DevicePower(device.id.clone()))
            } else if device.water_sensor.as_deref() == Some(entity_id) {
                Some(EntityBinding::WaterSensor(device.id.clone()))
            } else {
                None
            }
        })
    }

    /// Every entity the host must forward state changes for.
    pub fn watched_entities(&self) -> Vec<String> {
        let mut entities: BTreeSet<String> = self.global.room_sensors.iter().cloned().collect();
        entities.extend(self.global.net_power_sensor.iter().cloned());
        for device in &self.devices {
            entities.insert(device.climate_entity.clone());
            entities.extend(device.power_sensor.iter().cloned());
            entities.extend(device.water_sensor.iter().cloned());
        }
        entities.into_iter().collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let global = &self.global;

        if global.room_sensors.is_empty() {
            return Err(ConfigError::NoRoomSensors);
        }
        if global.room_sensors.iter().any(|id| id.trim().is_empty()) {
            return Err(ConfigError::EmptyIdentifier("room sensor id"));
        }

        require_finite("min_setpoint", global.min_setpoint)?;
        require_finite("max_setpoint", global.max_setpoint)?;
        if global.min_setpoint >= global.max_setpoint {
            return Err(ConfigError::SetpointRange {
                min: global.min_setpoint,
                max: global.max_setpoint,
            });
        }

        require_finite("on_eta_threshold_min", global.on_eta_threshold_min)?;
        require_finite("off_eta_threshold_min", global.off_eta_threshold_min)?;
        require_non_negative("off_eta_threshold_min", global.off_eta_threshold_min)?;
        if global.off_eta_threshold_min >= global.on_eta_threshold_min {
            return Err(ConfigError::EtaThresholdsInverted {
                on: global.on_eta_threshold_min,
                off: global.off_eta_threshold_min,
            });
        }

        require_finite("water_on_threshold_c", global.water_on_threshold_c)?;
        require_finite("stall_delta_c", global.stall_delta_c)?;
        require_non_negative("stall_delta_c", global.stall_delta_c)?;

        for (name, value) in [
            ("assist_timer_ms", global.assist_timer_ms),
            ("sensor_stale_timeout_ms", global.sensor_stale_timeout_ms),
            ("room_window_ms", global.room_window_ms),
            ("water_window_ms", global.water_window_ms),
            ("device_window_ms", global.device_window_ms),
            ("tick_interval_ms", global.tick_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive(name));
            }
        }

        let power = &self.power;
        for (name, value) in [
            ("reserve_w", power.reserve_w),
            ("min_budget_w", power.min_budget_w),
            ("primary_max_increment_w", power.primary_max_increment_w),
            ("assist_max_increment_w", power.assist_max_increment_w),
            ("deadband_pct", power.deadband_pct),
        ] {
            require_finite(name, value)?;
            require_non_negative(name, value)?;
        }
        require_finite("step_c", power.step_c)?;
        if power.step_c <= 0.0 {
            return Err(ConfigError::NotPositive("step_c"));
        }

        let mut seen = BTreeSet::new();
        let mut primaries = 0;
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(ConfigError::EmptyIdentifier("device id"));
            }
            if device.climate_entity.trim().is_empty() {
                return Err(ConfigError::EmptyIdentifier("climate entity"));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.id.clone()));
            }
            match device.role {
                DeviceRole::Primary => {
                    primaries += 1;
                    if device.allow_on_off_control {
                        return Err(ConfigError::OnOffControlOnPrimary(device.id.clone()));
                    }
                }
                DeviceRole::Assist => {
                    if device.water_sensor.is_some() {
                        return Err(ConfigError::WaterSensorOnAssist(device.id.clone()));
                    }
                }
            }

            let offsets = device.offsets();
            check_offset(&device.id, "lower", offsets.lower, LOWER_OFFSET_RANGE)?;
            check_offset(&device.id, "upper", offsets.upper, UPPER_OFFSET_RANGE)?;
        }
        if primaries > 1 {
            return Err(ConfigError::MultiplePrimaries);
        }

        let mut bound = BTreeSet::new();
        let entities = global
            .room_sensors
            .iter()
            .chain(global.net_power_sensor.iter())
            .chain(self.devices.iter().flat_map(|device| {
                std::iter::once(&device.climate_entity)
                    .chain(device.power_sensor.iter())
                    .chain(device.water_sensor.iter())
            }));
        for entity_id in entities {
            if !bound.insert(entity_id.as_str()) {
                return Err(ConfigError::DuplicateEntity(entity_id.clone()));
            }
        }

        Ok(())
    }
}

fn require_finite(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NotFinite(name))
    }
}

fn require_non_negative(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value < 0.0 {
        Err(ConfigError::Negative(name))
    } else {
        Ok(())
    }
}

fn check_offset(
    device: &str,
    field: &'static str,
    value: f64,
    (min, max): (f64, f64),
) -> Result<(), ConfigError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OffsetOutOfRange {
            device: device.to_string(),
            field,
            value,
            min,
            max,
        })
    }
}

/// User-facing thermostat controls that survive restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermostatSettings {
    pub target_temperature: f64,
    pub hvac_mode: HvacMode,
    pub preset: Preset,
}

impl Default for ThermostatSettings {
    fn default() -> Self {
        Self {
            target_temperature: DEFAULT_TARGET_TEMPERATURE,
            hvac_mode: HvacMode::Heat,
            preset: Preset::None,
        }
    }
}

impl ThermostatSettings {
    pub fn sanitize(&mut self) {
        self.target_temperature = if self.target_temperature.is_finite() {
            self.target_temperature
                .clamp(MIN_TARGET_TEMPERATURE, MAX_TARGET_TEMPERATURE)
        } else {
            DEFAULT_TARGET_TEMPERATURE
        };
        if self.preset == Preset::Boost {
            self.hvac_mode = HvacMode::Heat;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    pub settings: ThermostatSettings,
    pub network: NetworkConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ControllerConfig {
        let mut primary = DeviceConfig::new("hp1", DeviceRole::Primary, "climate.hydro");
        primary.water_sensor = Some("sensor.flow_temp".to_string());
        let mut assist = DeviceConfig::new("hp2", DeviceRole::Assist, "climate.living_room_hp");
        assist.allow_on_off_control = true;

        ControllerConfig {
            global: GlobalConfig {
                room_sensors: vec!["sensor.room".to_string()],
                ..GlobalConfig::default()
            },
            power: PowerConfig::default(),
            devices: vec![assist, primary],
        }
    }

    #[test]
    fn default_shaped_config_is_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_eta_thresholds() {
        let mut config = valid_config();
        config.global.off_eta_threshold_min = 60.0;
        config.global.on_eta_threshold_min = 60.0;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::EtaThresholdsInverted { .. })
        ));
    }

    #[test]
    fn rejects_offsets_outside_range() {
        let mut config = valid_config();
        config.devices[0].lower_offset = Some(-5.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OffsetOutOfRange { field: "lower", .. })
        ));

        let mut config = valid_config();
        config.devices[0].upper_offset = Some(f64::NAN);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OffsetOutOfRange { field: "upper", .. })
        ));
    }

    #[test]
    fn rejects_structural_mistakes() {
        let mut config = valid_config();
        config.global.min_setpoint = 30.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SetpointRange { .. })
        ));

        let mut config = valid_config();
        config.devices[1].id = "hp2".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateDevice(_))
        ));

        let mut config = valid_config();
        config.devices[0].water_sensor = Some("sensor.other".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WaterSensorOnAssist(_))
        ));

        let mut config = valid_config();
        config.global.room_sensors.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoRoomSensors)));
    }

    #[test]
    fn rejects_entities_bound_twice() {
        let mut config = valid_config();
        config.devices[0].climate_entity = "climate.hydro".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateEntity(entity)) if entity == "climate.hydro"
        ));

        let mut config = valid_config();
        config.devices[0].power_sensor = Some("sensor.room".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateEntity(entity)) if entity == "sensor.room"
        ));

        let mut config = valid_config();
        config.global.net_power_sensor = Some("sensor.flow_temp".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateEntity(_))
        ));

        let mut config = valid_config();
        config.global.room_sensors.push("sensor.room".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateEntity(_))
        ));
    }

    #[test]
    fn offsets_default_by_role() {
        let config = valid_config();
        assert_eq!(config.devices[0].offsets(), DEFAULT_ASSIST_OFFSETS);
        assert_eq!(config.devices[1].offsets(), DEFAULT_PRIMARY_OFFSETS);
    }

    #[test]
    fn ordered_devices_put_primary_first() {
        let ids: Vec<String> = valid_config()
            .ordered_devices()
            .into_iter()
            .map(|device| device.id)
            .collect();
        assert_eq!(ids, vec!["hp1", "hp2"]);
    }

    #[test]
    fn bindings_resolve_every_configured_entity() {
        let config = valid_config();
        assert_eq!(
            config.binding("sensor.room"),
            Some(EntityBinding::RoomSensor)
        );
        assert_eq!(
            config.binding("climate.hydro"),
            Some(EntityBinding::DeviceClimate("hp1".to_string()))
        );
        assert_eq!(
            config.binding("sensor.flow_temp"),
            Some(EntityBinding::WaterSensor("hp1".to_string()))
        );
        assert_eq!(config.binding("sensor.unrelated"), None);
    }

    #[test]
    fn display_name_is_derived_from_entity() {
        assert_eq!(
            display_name_from_entity("climate.living_room_hp"),
            "Living Room Hp"
        );
        assert_eq!(display_name_from_entity("hydro"), "Hydro");
    }

    #[test]
    fn parses_partial_json_with_defaults() {
        let raw = r#"{
            "global": { "room_sensors": ["sensor.room"] },
            "devices": [
                { "id": "hp1", "role": "primary", "climate_entity": "climate.hydro" }
            ]
        }"#;
        let config = ControllerConfig::from_json(raw).unwrap();
        assert_eq!(config.global.assist_timer_ms, 300_000);
        assert_eq!(config.devices[0].offsets(), DEFAULT_PRIMARY_OFFSETS);
    }

    #[test]
    fn sanitize_clamps_target_and_forces_heat_in_boost() {
        let mut settings = ThermostatSettings {
            target_temperature: 45.0,
            hvac_mode: HvacMode::Off,
            preset: Preset::Boost,
        };
        settings.sanitize();
        assert_eq!(settings.target_temperature, MAX_TARGET_TEMPERATURE);
        assert_eq!(settings.hvac_mode, HvacMode::Heat);
    }
}

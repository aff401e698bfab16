use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    assist::{ConditionInputs, GuardBlock},
    config::{
        ConfigError, ControllerConfig, EntityBinding, ThermostatSettings, MAX_TARGET_TEMPERATURE,
        MIN_TARGET_TEMPERATURE,
    },
    device::{DeviceCommand, DeviceRuntimeState, Reading, TickContext},
    power::{allocate, surplus_w, AllocationOutcome, AllocationRequest},
    status::{
        format_eta, format_room_average, format_temperature, ControllerStatus, DeviceStatus,
        ThermalSummary,
    },
    store::{StoreError, TimerRecord, TimerRecords, TimerStore},
    trend::{eta_minutes, SampleWindow},
    types::{DeviceBehavior, DeviceRole, HvacMode, Preset},
};

/// A state change forwarded by the host for a watched entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Numeric sensor state; `None` while the sensor is unavailable.
    Numeric(Option<f64>),
    Climate {
        hvac_mode: Option<HvacMode>,
        current_temperature: Option<f64>,
        /// The setpoint the device itself reports.
        target_temperature: Option<f64>,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ControlError {
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("device {0} has not reported an HVAC mode")]
    DeviceUnavailable(String),
    #[error("the primary device's mode follows the thermostat")]
    PrimaryModeForced,
    #[error("power budgets are only accepted while the solar preset is active")]
    NotInSolar,
    #[error("no net power sensor is configured")]
    NoNetPowerSensor,
    #[error("invalid power budget {0} W")]
    InvalidBudget(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManualToggle {
    Applied(Vec<DeviceCommand>),
    Unchanged,
    Blocked(GuardBlock),
}

/// Single-writer orchestrator behind the virtual thermostat.
pub struct ThermostatEngine {
    config: ControllerConfig,
    settings: ThermostatSettings,

    room_readings: BTreeMap<String, Reading>,
    room_window: SampleWindow,
    net_power: Option<Reading>,

    devices: BTreeMap<String, DeviceRuntimeState>,
    restored_timers: TimerRecords,

    budget_overrides: BTreeMap<String, f64>,
    allocation: Option<AllocationOutcome>,

    last_tick_ms: Option<u64>,

    store: Option<Box<dyn TimerStore>>,
    persistence_degraded: bool,
}

impl ThermostatEngine {
    pub fn new(
        config: ControllerConfig,
        mut settings: ThermostatSettings,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        settings.sanitize();
        Ok(Self {
            room_window: SampleWindow::new(config.global.room_window_ms),
            config,
            settings,
            room_readings: BTreeMap::new(),
            net_power: None,
            devices: BTreeMap::new(),
            restored_timers: TimerRecords::new(),
            budget_overrides: BTreeMap::new(),
            allocation: None,
            last_tick_ms: None,
            store: None,
            persistence_degraded: false,
        })
    }

    /// Loads persisted timers and keeps the store for later saves. A failing
    /// store leaves the engine running on in-memory timers.
    pub fn attach_store(&mut self, mut store: Box<dyn TimerStore>) {
        match store.load() {
            Ok(records) => {
                let mut restored = 0;
                for (device_id, record) in records {
                    if self.config.device(&device_id).is_none() {
                        continue;
                    }
                    restored += 1;
                    match self.devices.get_mut(&device_id) {
                        Some(state) => {
                            state.timers = record.into();
                            state.persisted = Some(record);
                        }
                        None => {
                            self.restored_timers.insert(device_id, record);
                        }
                    }
                }
                info!(devices = restored, "restored device timers");
            }
            Err(err) => note_persistence_failure(&mut self.persistence_degraded, &err),
        }
        self.store = Some(store);
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn settings(&self) -> &ThermostatSettings {
        &self.settings
    }

    pub fn device_state(&self, device_id: &str) -> Option<&DeviceRuntimeState> {
        self.devices.get(device_id)
    }

    pub fn allocation(&self) -> Option<&AllocationOutcome> {
        self.allocation.as_ref()
    }

    pub fn is_persistence_degraded(&self) -> bool {
        self.persistence_degraded
    }

    /// Applies a state change. Returns `false` when the entity is not bound
    /// to anything in the current configuration.
    pub fn observe(&mut self, entity_id: &str, observation: Observation, now_ms: u64) -> bool {
        let Some(binding) = self.config.binding(entity_id) else {
            return false;
        };

        match (binding, observation) {
            (EntityBinding::RoomSensor, Observation::Numeric(value)) => {
                match value.and_then(|value| Reading::new(value, now_ms)) {
                    Some(reading) => {
                        self.room_readings.insert(entity_id.to_string(), reading);
                    }
                    None => debug!(entity = entity_id, "room sensor unavailable"),
                }
            }
            (EntityBinding::NetPower, Observation::Numeric(value)) => {
                match value.and_then(|value| Reading::new(value, now_ms)) {
                    Some(reading) => self.net_power = Some(reading),
                    None => debug!(entity = entity_id, "net power sensor unavailable"),
                }
            }
            (
                EntityBinding::DeviceClimate(device_id),
                Observation::Climate {
                    hvac_mode,
                    current_temperature,
                    target_temperature,
                },
            ) => {
                let copy_setpoint = self
                    .config
                    .device(&device_id)
                    .is_some_and(|device| device.copy_setpoint_to_thermostat);
                let user_setpoint = self.device_entry(&device_id).observe_climate(
                    &device_id,
                    hvac_mode,
                    current_temperature,
                    target_temperature,
                    now_ms,
                );
                if let Some(setpoint) = user_setpoint.filter(|_| copy_setpoint) {
                    if self.set_target_temperature(setpoint) {
                        info!(
                            device = %device_id,
                            target = self.settings.target_temperature,
                            "target copied from device setpoint"
                        );
                    }
                }
                // An external toggle restarts the dwell window.
                self.persist_timers();
            }
            (EntityBinding::DevicePower(device_id), Observation::Numeric(value)) => {
                if let Some(reading) = value.and_then(|value| Reading::new(value, now_ms)) {
                    self.device_entry(&device_id).power = Some(reading);
                }
            }
            (EntityBinding::WaterSensor(device_id), Observation::Numeric(value)) => {
                if let Some(reading) = value.and_then(|value| Reading::new(value, now_ms)) {
                    self.device_entry(&device_id).water = Some(reading);
                }
            }
            (binding, observation) => {
                debug!(entity = entity_id, ?binding, ?observation, "ignoring mismatched observation");
            }
        }
        true
    }

    pub fn set_target_temperature(&mut self, target: f64) -> bool {
        if !target.is_finite() {
            return false;
        }
        let clamped = target.clamp(MIN_TARGET_TEMPERATURE, MAX_TARGET_TEMPERATURE);
        if (self.settings.target_temperature - clamped).abs() > f64::EPSILON {
            self.settings.target_temperature = clamped;
            true
        } else {
            false
        }
    }

    /// Setting a mode always drops back to no preset.
    pub fn set_hvac_mode(&mut self, mode: HvacMode) -> bool {
        let changed = self.settings.hvac_mode != mode || self.settings.preset != Preset::None;
        if changed {
            self.settings.hvac_mode = mode;
            self.change_preset(Preset::None);
        }
        changed
    }

    pub fn set_preset(&mut self, preset: Preset) -> bool {
        if self.settings.preset == preset {
            return false;
        }
        if preset == Preset::Boost {
            self.settings.hvac_mode = HvacMode::Heat;
        }
        self.change_preset(preset);
        true
    }

    /// Pins a device's budget, bypassing the allocator, until cleared or the
    /// preset changes.
    pub fn set_power_budget(&mut self, device_id: &str, watts: f64) -> Result<(), ControlError> {
        if self.config.device(device_id).is_none() {
            return Err(ControlError::UnknownDevice(device_id.to_string()));
        }
        if !watts.is_finite() || watts < 0.0 {
            return Err(ControlError::InvalidBudget(watts));
        }
        if self.config.global.net_power_sensor.is_none() {
            return Err(ControlError::NoNetPowerSensor);
        }
        if self.settings.preset != Preset::Solar {
            return Err(ControlError::NotInSolar);
        }
        info!(device = device_id, watts, "power budget override set");
        self.budget_overrides.insert(device_id.to_string(), watts);
        Ok(())
    }

    pub fn clear_power_budget(&mut self, device_id: &str) -> Result<bool, ControlError> {
        if self.config.device(device_id).is_none() {
            return Err(ControlError::UnknownDevice(device_id.to_string()));
        }
        let cleared = self.budget_overrides.remove(device_id).is_some();
        if cleared {
            info!(device = device_id, "power budget override cleared");
        }
        Ok(cleared)
    }

    /// User-requested mode change for an assist, subject to the same dwell
    /// guard as automatic transitions.
    pub fn request_device_mode(
        &mut self,
        device_id: &str,
        mode: HvacMode,
        now_ms: u64,
    ) -> Result<ManualToggle, ControlError> {
        let device = self
            .config
            .device(device_id)
            .cloned()
            .ok_or_else(|| ControlError::UnknownDevice(device_id.to_string()))?;
        if device.role == DeviceRole::Primary {
            return Err(ControlError::PrimaryModeForced);
        }
        let state = self
            .devices
            .get_mut(device_id)
            .filter(|state| state.online_mode().is_some())
            .ok_or_else(|| ControlError::DeviceUnavailable(device_id.to_string()))?;

        if state.intended_mode() == Some(mode) {
            return Ok(ManualToggle::Unchanged);
        }
        if let Err(block) = state.timers.guard(mode, now_ms, &self.config.global) {
            info!(
                device = device_id,
                mode = mode.as_str(),
                blocked = %block.describe(),
                "manual mode change rejected"
            );
            state.manual_block = Some((block, now_ms.saturating_add(block.remaining_ms)));
            return Ok(ManualToggle::Blocked(block));
        }

        let mut commands = Vec::new();
        state.command_mode(&device, mode, now_ms, &mut commands);
        state.timers.record_transition(now_ms);
        state.manual_block = None;
        info!(device = device_id, mode = mode.as_str(), "manual mode change");

        self.persist_timers();
        Ok(ManualToggle::Applied(commands))
    }

    /// Replaces the configuration after validating it. State of devices that
    /// disappeared is discarded.
    pub fn reconfigure(&mut self, config: ControllerConfig) -> Result<(), ConfigError> {
        config.validate()?;

        let removed: Vec<String> = self
            .devices
            .keys()
            .chain(self.restored_timers.keys())
            .filter(|device_id| {
                match (config.device(device_id), self.config.device(device_id)) {
                    (Some(next), Some(previous)) => next.climate_entity != previous.climate_entity,
                    (Some(_), None) => false,
                    (None, _) => true,
                }
            })
            .cloned()
            .collect();
        for device_id in removed {
            self.remove_device(&device_id);
        }

        if config.global.room_window_ms != self.config.global.room_window_ms {
            self.room_window = SampleWindow::new(config.global.room_window_ms);
        }
        self.room_readings
            .retain(|entity_id, _| config.global.room_sensors.contains(entity_id));
        if config.global.net_power_sensor != self.config.global.net_power_sensor {
            self.net_power = None;
        }
        self.budget_overrides
            .retain(|device_id, _| config.device(device_id).is_some());

        info!(devices = config.devices.len(), "configuration updated");
        self.config = config;
        Ok(())
    }

    /// Drops all state of a device. Safe to call for unknown ids.
    pub fn remove_device(&mut self, device_id: &str) -> bool {
        let had_state = self.devices.remove(device_id).is_some();
        let had_timers = self.restored_timers.remove(device_id).is_some();
        self.budget_overrides.remove(device_id);
        if let Some(store) = self.store.as_mut() {
            if let Err(err) = store.remove(device_id) {
                note_persistence_failure(&mut self.persistence_degraded, &err);
            }
        }
        if had_state {
            info!(device = device_id, "device state discarded");
        }
        had_state || had_timers
    }

    /// Runs one control pass and returns the commands to send.
    pub fn tick(&mut self, now_ms: u64) -> Vec<DeviceCommand> {
        if let Some(last_ms) = self.last_tick_ms.filter(|last_ms| now_ms < *last_ms) {
            warn!(last_ms, now_ms, "clock went backwards, restarting trends");
            self.room_window.clear();
            for state in self.devices.values_mut() {
                state.reset_history();
            }
        }
        let elapsed_ms = self
            .last_tick_ms
            .map(|last| now_ms.saturating_sub(last))
            .unwrap_or(0);
        self.last_tick_ms = Some(now_ms);

        let stale_ms = self.config.global.sensor_stale_timeout_ms;
        let room_temperature = self.room_temperature(now_ms);
        if let Some(room) = room_temperature {
            self.room_window.record(now_ms, room);
        }
        self.room_window.expire(now_ms);
        for state in self.devices.values_mut() {
            state.refresh_windows(now_ms, stale_ms);
        }

        let target = self.settings.target_temperature;
        let room_derivative = self.room_window.derivative();
        let inputs = ConditionInputs {
            room_temperature,
            target,
            room_derivative,
            room_eta_minutes: room_temperature
                .and_then(|room| eta_minutes(room, target, room_derivative)),
            water_temperature: self.water_temperature(now_ms),
        };

        self.refresh_allocation(now_ms);

        let ctx = TickContext {
            global: &self.config.global,
            power: &self.config.power,
            settings: &self.settings,
            inputs,
            elapsed_ms,
            now_ms,
        };
        let mut commands = Vec::new();
        for device in self.config.ordered_devices() {
            let budget_w = device_budget(
                self.settings.preset,
                &self.budget_overrides,
                self.allocation.as_ref(),
                &device.id,
            );
            if let Some(state) = self.devices.get_mut(&device.id) {
                state.control(&device, &ctx, budget_w, &mut commands);
            }
        }

        self.persist_timers();
        commands
    }

    pub fn status(&self, now_ms: u64) -> ControllerStatus {
        let global = &self.config.global;
        let stale_ms = global.sensor_stale_timeout_ms;
        let target = self.settings.target_temperature;

        let room_values = self.room_values(now_ms);
        let room_temperature = average(&room_values);
        let room_derivative = self.room_window.derivative();
        let room_eta = room_temperature.and_then(|room| eta_minutes(room, target, room_derivative));
        let water_temperature = self.water_temperature(now_ms);
        let water_derivative = self
            .config
            .primary()
            .and_then(|primary| self.devices.get(&primary.id))
            .and_then(|state| state.water_window.derivative());

        let devices: Vec<DeviceStatus> = self
            .config
            .ordered_devices()
            .iter()
            .map(|device| {
                let state = self.devices.get(&device.id);
                let online = state.and_then(DeviceRuntimeState::online_mode);
                let current = state.and_then(|state| state.fresh_temperature(now_ms, stale_ms));
                let derivative = state.and_then(|state| state.temperature_window.derivative());
                let setpoint = state.and_then(|state| state.commanded_setpoint);
                let timers = state.map(|state| state.timers.clone()).unwrap_or_default();
                let blocked = state
                    .and_then(|state| state.manual_block_at(now_ms).or(state.blocked))
                    .map(|block| block.describe());

                let mut entry = DeviceStatus {
                    id: device.id.clone(),
                    name: device.display_name(),
                    role: device.role.as_str(),
                    climate_entity: device.climate_entity.clone(),
                    available: online.is_some(),
                    hvac_mode: online.map(HvacMode::as_str),
                    behavior: state
                        .map(|state| state.behavior)
                        .unwrap_or(DeviceBehavior::Unavailable)
                        .as_str(),
                    automatic: device.is_automatic(),
                    current_temperature: current,
                    temperature_derivative: derivative,
                    eta_minutes: match (current, setpoint) {
                        (Some(current), Some(setpoint)) => eta_minutes(current, setpoint, derivative),
                        _ => None,
                    },
                    commanded_mode: state
                        .and_then(|state| state.commanded_mode)
                        .map(HvacMode::as_str),
                    commanded_setpoint: setpoint,
                    water_temperature: state.and_then(|state| state.fresh_water(now_ms, stale_ms)),
                    power_w: state.and_then(|state| state.fresh_power(now_ms, stale_ms)),
                    budget_w: state.and_then(|state| state.budget_w),
                    budget_override: self.budget_overrides.contains_key(&device.id),
                    on_timer_s: timers.on_condition_ms / 1_000,
                    off_timer_s: timers.off_condition_ms / 1_000,
                    active_condition: timers.active_condition.map(|condition| condition.as_str()),
                    target_hvac_mode: state
                        .and_then(|state| state.target_hvac_mode)
                        .map(HvacMode::as_str),
                    blocked,
                    last_transition_ms: timers.last_transition_ms,
                    summary: String::new(),
                };
                entry.summary = entry.describe(global.assist_timer_ms);
                entry
            })
            .collect();

        let running = |role: DeviceRole| {
            self.config.devices.iter().any(|device| {
                device.role == role
                    && self
                        .devices
                        .get(&device.id)
                        .is_some_and(DeviceRuntimeState::is_running)
            })
        };
        let mode = if self.settings.hvac_mode == HvacMode::Off {
            "off"
        } else if running(DeviceRole::Assist) {
            "assist"
        } else if running(DeviceRole::Primary) {
            "primary_only"
        } else {
            "idle"
        };
        let active_devices: Vec<String> = devices
            .iter()
            .filter(|device| device.hvac_mode == Some(HvacMode::Heat.as_str()))
            .map(|device| device.name.clone())
            .collect();

        let override_total: f64 = self.budget_overrides.values().sum();
        let budgets_active = self.settings.preset == Preset::Solar
            && (self.allocation.is_some() || !self.budget_overrides.is_empty());

        let mut thermal = ThermalSummary {
            hvac_mode: self.settings.hvac_mode.as_str(),
            preset: self.settings.preset.as_str(),
            mode,
            target_temperature: target,
            room_temperature,
            room_average: room_temperature.map(|room| format_room_average(&room_values, room)),
            delta: room_temperature.map(|room| target - room),
            room_derivative,
            room_eta_minutes: room_eta,
            water_temperature,
            water_derivative,
            active_devices,
            net_power_w: self
                .net_power
                .and_then(|reading| reading.fresh(now_ms, stale_ms)),
            surplus_w: self.allocation.as_ref().map(|outcome| outcome.surplus_w),
            budget_total_w: budgets_active.then(|| {
                self.allocation
                    .as_ref()
                    .map(AllocationOutcome::allocated_w)
                    .unwrap_or(0.0)
                    + override_total
            }),
            budget_remaining_w: self.allocation.as_ref().map(|outcome| outcome.remaining_w),
            assist_timer_s: global.assist_timer_ms / 1_000,
            on_eta_threshold_min: global.on_eta_threshold_min,
            off_eta_threshold_min: global.off_eta_threshold_min,
            min_on_s: global.min_on_ms / 1_000,
            min_off_s: global.min_off_ms / 1_000,
            persistence_degraded: self.persistence_degraded,
            summary: String::new(),
        };
        thermal.summary = describe_thermal(&thermal);

        ControllerStatus { thermal, devices }
    }

    fn change_preset(&mut self, preset: Preset) {
        if self.settings.preset != preset {
            info!(
                from = self.settings.preset.as_str(),
                to = preset.as_str(),
                "preset changed"
            );
        }
        self.settings.preset = preset;
        self.budget_overrides.clear();
        self.allocation = None;
        for state in self.devices.values_mut() {
            state.budget_w = None;
            state.stepper.reset();
        }
    }

    fn device_entry(&mut self, device_id: &str) -> &mut DeviceRuntimeState {
        let global = &self.config.global;
        let restored = &mut self.restored_timers;
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRuntimeState::new(global, restored.remove(device_id)))
    }

    fn room_values(&self, now_ms: u64) -> Vec<f64> {
        let stale_ms = self.config.global.sensor_stale_timeout_ms;
        self.config
            .global
            .room_sensors
            .iter()
            .filter_map(|entity_id| self.room_readings.get(entity_id))
            .filter_map(|reading| reading.fresh(now_ms, stale_ms))
            .collect()
    }

    fn room_temperature(&self, now_ms: u64) -> Option<f64> {
        average(&self.room_values(now_ms))
    }

    fn water_temperature(&self, now_ms: u64) -> Option<f64> {
        let primary = self.config.primary()?;
        self.devices
            .get(&primary.id)?
            .fresh_water(now_ms, self.config.global.sensor_stale_timeout_ms)
    }

    fn refresh_allocation(&mut self, now_ms: u64) {
        self.allocation = None;
        if self.settings.preset != Preset::Solar {
            return;
        }

        let stale_ms = self.config.global.sensor_stale_timeout_ms;
        let net_power = self
            .net_power
            .and_then(|reading| reading.fresh(now_ms, stale_ms));
        let Some(net_power) = net_power else {
            if !self.budget_overrides.is_empty() {
                warn!("net power reading lost, clearing power budget overrides");
                self.budget_overrides.clear();
            }
            return;
        };

        let power = &self.config.power;
        let requests: Vec<AllocationRequest> = self
            .config
            .ordered_devices()
            .into_iter()
            .filter(|device| !self.budget_overrides.contains_key(&device.id))
            .filter_map(|device| {
                let state = self.devices.get(&device.id)?;
                state.is_running().then(|| AllocationRequest {
                    draw_w: state.fresh_power(now_ms, stale_ms).unwrap_or(0.0),
                    max_increment_w: power.max_increment_w(device.role),
                    device_id: device.id,
                })
            })
            .collect();

        let outcome = allocate(
            &requests,
            surplus_w(net_power, power.reserve_w),
            power.min_budget_w,
        );
        debug!(
            surplus_w = outcome.surplus_w,
            remaining_w = outcome.remaining_w,
            "power budget allocated"
        );
        self.allocation = Some(outcome);
    }

    /// Saves changed records. While the store reports a failure every record
    /// is offered again, so a recovered store ends up with the full set.
    fn persist_timers(&mut self) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        let mut failure = store.health().err();
        for (device_id, state) in self.devices.iter_mut() {
            let record = TimerRecord::from(&state.timers);
            if failure.is_none() && state.persisted == Some(record) {
                continue;
            }
            match store.save(device_id, &record) {
                Ok(()) => state.persisted = Some(record),
                Err(err) => {
                    state.persisted = None;
                    failure.get_or_insert(err);
                }
            }
        }

        match failure {
            Some(err) => note_persistence_failure(&mut self.persistence_degraded, &err),
            None if self.persistence_degraded => {
                info!("timer persistence recovered");
                self.persistence_degraded = false;
            }
            None => {}
        }
    }
}

fn note_persistence_failure(degraded: &mut bool, err: &StoreError) {
    if *degraded {
        debug!("timer persistence still failing: {err}");
    } else {
        warn!("timer persistence failed, continuing with in-memory timers: {err}");
        *degraded = true;
    }
}

fn device_budget(
    preset: Preset,
    overrides: &BTreeMap<String, f64>,
    allocation: Option<&AllocationOutcome>,
    device_id: &str,
) -> Option<f64> {
    if preset != Preset::Solar {
        return None;
    }
    overrides
        .get(device_id)
        .copied()
        .filter(|watts| *watts > 0.0)
        .or_else(|| allocation.and_then(|outcome| outcome.budget_for(device_id)))
}

fn average(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn describe_thermal(thermal: &ThermalSummary) -> String {
    let mut parts = vec![format!(
        "{} {} | {}",
        thermal.hvac_mode, thermal.preset, thermal.mode
    )];
    match thermal.room_temperature {
        Some(room) => parts.push(format!(
            "Room {} → {}",
            format_temperature(room),
            format_temperature(thermal.target_temperature)
        )),
        None => parts.push(format!(
            "Room unavailable → {}",
            format_temperature(thermal.target_temperature)
        )),
    }
    if let Some(derivative) = thermal.room_derivative {
        parts.push(format!("ΔT {derivative:.1}°C/h"));
    }
    if let Some(eta) = thermal.room_eta_minutes {
        parts.push(format!("ETA {}", format_eta(eta)));
    }
    if let Some(water) = thermal.water_temperature {
        parts.push(format!("Water {}", format_temperature(water)));
    }
    if let Some(budget) = thermal.budget_total_w {
        parts.push(format!("Budget {budget:.0} W"));
    }
    if !thermal.active_devices.is_empty() {
        parts.push(format!("Active: {}", thermal.active_devices.join(", ")));
    }
    parts.join(" | ")
}

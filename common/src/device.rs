use tracing::{debug, info};

use crate::{
    assist::{AssistDecision, AssistTimers, ConditionInputs, GuardBlock},
    config::{DeviceConfig, GlobalConfig, PowerConfig, ThermostatSettings},
    policy::{
        compute_setpoint, mode_directive, setpoint_mode, ModeDirective, SetpointLimits,
        SetpointMode, TemperatureSource,
    },
    power::PowerStepper,
    store::TimerRecord,
    trend::SampleWindow,
    types::{DeviceBehavior, DeviceRole, HvacMode, Preset},
};

/// Setpoints closer than this to the last commanded value are not re-sent.
pub const SETPOINT_COMPARISON_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    SetHvacMode { entity_id: String, mode: HvacMode },
    SetTemperature { entity_id: String, temperature: f64 },
}

impl DeviceCommand {
    pub fn entity_id(&self) -> &str {
        match self {
            Self::SetHvacMode { entity_id, .. } | Self::SetTemperature { entity_id, .. } => {
                entity_id
            }
        }
    }
}

/// Last known value of a sensor and when it arrived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub updated_ms: u64,
}

impl Reading {
    pub fn new(value: f64, updated_ms: u64) -> Option<Self> {
        value.is_finite().then_some(Self { value, updated_ms })
    }

    /// The value while it is younger than `stale_timeout_ms`.
    pub fn fresh(&self, now_ms: u64, stale_timeout_ms: u64) -> Option<f64> {
        (now_ms.saturating_sub(self.updated_ms) <= stale_timeout_ms).then_some(self.value)
    }
}

/// Everything a device step needs from the tick that drives it.
#[derive(Debug, Clone, Copy)]
pub struct TickContext<'a> {
    pub global: &'a GlobalConfig,
    pub power: &'a PowerConfig,
    pub settings: &'a ThermostatSettings,
    pub inputs: ConditionInputs,
    pub elapsed_ms: u64,
    pub now_ms: u64,
}

impl TickContext<'_> {
    fn limits(&self) -> SetpointLimits {
        SetpointLimits {
            min: self.global.min_setpoint,
            max: self.global.max_setpoint,
        }
    }
}

/// Reported setpoints closer than this to the previous report are noise.
const REPORTED_SETPOINT_EPSILON: f64 = 0.01;

fn cooled_down(last_ms: Option<u64>, now_ms: u64, cooldown_ms: u64) -> bool {
    last_ms.map_or(true, |last| now_ms.saturating_sub(last) >= cooldown_ms)
}

/// Runtime record of one configured device, owned by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRuntimeState {
    pub available: bool,
    /// Last HVAC mode the climate entity reported; `None` until it reports.
    pub hvac_mode: Option<HvacMode>,
    pub commanded_mode: Option<HvacMode>,
    /// Commanded mode the device has not confirmed yet. Re-sent while the
    /// reported mode disagrees.
    pending_mode: Option<HvacMode>,
    pub commanded_setpoint: Option<f64>,
    pub reported_setpoint: Option<f64>,
    last_mode_command_ms: Option<u64>,
    last_setpoint_command_ms: Option<u64>,
    pub temperature: Option<Reading>,
    pub temperature_window: SampleWindow,
    pub water: Option<Reading>,
    pub water_window: SampleWindow,
    pub power: Option<Reading>,
    pub timers: AssistTimers,
    pub(crate) persisted: Option<TimerRecord>,
    pub stepper: PowerStepper,
    pub budget_w: Option<f64>,
    pub behavior: DeviceBehavior,
    pub target_hvac_mode: Option<HvacMode>,
    pub blocked: Option<GuardBlock>,
    /// Rejected manual toggle and when its dwell window ends.
    pub manual_block: Option<(GuardBlock, u64)>,
}

impl DeviceRuntimeState {
    pub fn new(global: &GlobalConfig, restored: Option<TimerRecord>) -> Self {
        let record = restored.unwrap_or_default();
        Self {
            available: false,
            hvac_mode: None,
            commanded_mode: None,
            pending_mode: None,
            commanded_setpoint: None,
            reported_setpoint: None,
            last_mode_command_ms: None,
            last_setpoint_command_ms: None,
            temperature: None,
            temperature_window: SampleWindow::new(global.device_window_ms),
            water: None,
            water_window: SampleWindow::new(global.water_window_ms),
            power: None,
            timers: AssistTimers::from(record),
            persisted: Some(record),
            stepper: PowerStepper::default(),
            budget_w: None,
            behavior: DeviceBehavior::Unavailable,
            target_hvac_mode: None,
            blocked: None,
            manual_block: None,
        }
    }

    /// Online devices have reported an HVAC mode and are not unavailable.
    pub fn online_mode(&self) -> Option<HvacMode> {
        self.hvac_mode.filter(|_| self.available)
    }

    /// The mode the controller is driving an online device toward.
    pub fn intended_mode(&self) -> Option<HvacMode> {
        self.online_mode()
            .map(|observed| self.pending_mode.unwrap_or(observed))
    }

    pub fn pending_mode(&self) -> Option<HvacMode> {
        self.pending_mode
    }

    pub fn is_running(&self) -> bool {
        self.online_mode().is_some_and(HvacMode::is_on)
    }

    /// Applies a climate entity report. Only a change from the previously
    /// reported mode that the controller did not ask for counts as a
    /// transition for the dwell guard.
    ///
    /// Returns the device's own setpoint when the user changed it on the
    /// device rather than the controller.
    pub fn observe_climate(
        &mut self,
        device_id: &str,
        hvac_mode: Option<HvacMode>,
        current_temperature: Option<f64>,
        reported_setpoint: Option<f64>,
        now_ms: u64,
    ) -> Option<f64> {
        match hvac_mode {
            None => {
                if self.available {
                    debug!(device = device_id, "climate entity unavailable");
                }
                self.available = false;
            }
            Some(mode) => {
                let previous = self.hvac_mode;
                self.available = true;
                self.hvac_mode = Some(mode);
                if self.pending_mode == Some(mode) {
                    self.pending_mode = None;
                } else if previous.is_some_and(|previous| previous != mode) {
                    info!(
                        device = device_id,
                        mode = mode.as_str(),
                        "mode changed outside the controller"
                    );
                    self.pending_mode = None;
                    self.timers.record_transition(now_ms);
                }
            }
        }
        if let Some(reading) = current_temperature.and_then(|value| Reading::new(value, now_ms)) {
            self.temperature = Some(reading);
        }

        let setpoint = reported_setpoint.filter(|value| value.is_finite())?;
        let previous = self.reported_setpoint.replace(setpoint)?;
        if (previous - setpoint).abs() < REPORTED_SETPOINT_EPSILON {
            return None;
        }
        let commanded = self
            .commanded_setpoint
            .is_some_and(|commanded| (commanded - setpoint).abs() < SETPOINT_COMPARISON_THRESHOLD);
        if commanded {
            return None;
        }
        debug!(device = device_id, setpoint, "setpoint changed on the device");
        // The device no longer holds what was last sent; send it again.
        self.commanded_setpoint = None;
        Some(setpoint)
    }

    pub fn fresh_temperature(&self, now_ms: u64, stale_timeout_ms: u64) -> Option<f64> {
        self.temperature
            .and_then(|reading| reading.fresh(now_ms, stale_timeout_ms))
    }

    pub fn fresh_water(&self, now_ms: u64, stale_timeout_ms: u64) -> Option<f64> {
        self.water
            .and_then(|reading| reading.fresh(now_ms, stale_timeout_ms))
    }

    pub fn fresh_power(&self, now_ms: u64, stale_timeout_ms: u64) -> Option<f64> {
        self.power
            .and_then(|reading| reading.fresh(now_ms, stale_timeout_ms))
    }

    /// Folds the current readings into the device windows.
    pub fn refresh_windows(&mut self, now_ms: u64, stale_timeout_ms: u64) {
        if let Some(value) = self.fresh_temperature(now_ms, stale_timeout_ms) {
            self.temperature_window.record(now_ms, value);
        }
        self.temperature_window.expire(now_ms);
        if let Some(value) = self.fresh_water(now_ms, stale_timeout_ms) {
            self.water_window.record(now_ms, value);
        }
        self.water_window.expire(now_ms);
    }

    /// Forgets everything keyed to a timeline that is no longer valid.
    pub fn reset_history(&mut self) {
        self.temperature_window.clear();
        self.water_window.clear();
        self.last_mode_command_ms = None;
        self.last_setpoint_command_ms = None;
        self.stepper.reset();
    }

    pub fn manual_block_at(&self, now_ms: u64) -> Option<GuardBlock> {
        self.manual_block.and_then(|(block, until_ms)| {
            (now_ms < until_ms).then_some(GuardBlock {
                to: block.to,
                remaining_ms: until_ms - now_ms,
            })
        })
    }

    /// Sends a mode change right away. Used for user requests, which are not
    /// held back by the command cooldown.
    pub fn command_mode(
        &mut self,
        device: &DeviceConfig,
        mode: HvacMode,
        now_ms: u64,
        commands: &mut Vec<DeviceCommand>,
    ) {
        self.plan_mode(mode);
        self.send_mode(device, mode, now_ms, commands);
    }

    /// Records a controller decision and sends it unless the entity was sent
    /// a mode too recently; a deferred command goes out on a later tick.
    fn request_mode(
        &mut self,
        device: &DeviceConfig,
        mode: HvacMode,
        ctx: &TickContext<'_>,
        commands: &mut Vec<DeviceCommand>,
    ) {
        self.plan_mode(mode);
        if cooled_down(
            self.last_mode_command_ms,
            ctx.now_ms,
            ctx.global.command_cooldown_ms,
        ) {
            self.send_mode(device, mode, ctx.now_ms, commands);
        } else {
            debug!(device = %device.id, mode = mode.as_str(), "mode command deferred by cooldown");
        }
    }

    fn plan_mode(&mut self, mode: HvacMode) {
        self.commanded_mode = Some(mode);
        self.pending_mode = (self.hvac_mode != Some(mode)).then_some(mode);
    }

    fn send_mode(
        &mut self,
        device: &DeviceConfig,
        mode: HvacMode,
        now_ms: u64,
        commands: &mut Vec<DeviceCommand>,
    ) {
        commands.push(DeviceCommand::SetHvacMode {
            entity_id: device.climate_entity.clone(),
            mode,
        });
        self.last_mode_command_ms = Some(now_ms);
    }

    /// Repeats an unconfirmed mode command once the cooldown allows it.
    fn resend_pending(
        &mut self,
        device: &DeviceConfig,
        observed: HvacMode,
        ctx: &TickContext<'_>,
        commands: &mut Vec<DeviceCommand>,
    ) {
        let Some(mode) = self.pending_mode.filter(|mode| *mode != observed) else {
            return;
        };
        if self.last_mode_command_ms == Some(ctx.now_ms)
            || !cooled_down(
                self.last_mode_command_ms,
                ctx.now_ms,
                ctx.global.command_cooldown_ms,
            )
        {
            return;
        }
        debug!(
            device = %device.id,
            mode = mode.as_str(),
            reported = observed.as_str(),
            "device has not confirmed mode, sending again"
        );
        self.send_mode(device, mode, ctx.now_ms, commands);
    }

    /// One control step: mode ownership, on/off state machine, then setpoint.
    pub fn control(
        &mut self,
        device: &DeviceConfig,
        ctx: &TickContext<'_>,
        budget_w: Option<f64>,
        commands: &mut Vec<DeviceCommand>,
    ) {
        self.budget_w = budget_w;
        self.blocked = None;
        self.target_hvac_mode = None;

        let Some(observed) = self.online_mode() else {
            self.behavior = DeviceBehavior::Unavailable;
            self.commanded_setpoint = None;
            return;
        };

        let directive = mode_directive(
            ctx.settings.hvac_mode,
            ctx.settings.preset,
            device.role,
            device.allow_on_off_control,
        );
        match directive {
            ModeDirective::Leave => {
                if device.is_automatic() {
                    self.timers.reset();
                }
                self.pending_mode = None;
            }
            ModeDirective::Force(mode) => self.apply_forced(device, observed, mode, ctx, commands),
            ModeDirective::Automatic => self.run_state_machine(device, observed, ctx, commands),
        }
        if directive != ModeDirective::Leave {
            self.resend_pending(device, observed, ctx, commands);
        }

        let running = self.intended_mode().is_some_and(HvacMode::is_on);
        if !running {
            self.behavior = DeviceBehavior::Off;
            self.commanded_setpoint = None;
            self.stepper.reset();
            return;
        }
        if ctx.settings.hvac_mode == HvacMode::Off {
            self.behavior = DeviceBehavior::Unmanaged;
            self.commanded_setpoint = None;
            self.stepper.reset();
            return;
        }

        self.apply_setpoint(device, budget_w, ctx, commands);
    }

    fn apply_forced(
        &mut self,
        device: &DeviceConfig,
        observed: HvacMode,
        mode: HvacMode,
        ctx: &TickContext<'_>,
        commands: &mut Vec<DeviceCommand>,
    ) {
        if device.is_automatic() {
            self.timers.reset();
        }
        if observed == mode {
            self.pending_mode = None;
            return;
        }
        if self.pending_mode == Some(mode) {
            // Already decided; waiting for the device to confirm.
            return;
        }

        match device.role {
            DeviceRole::Primary => {
                info!(device = %device.id, mode = mode.as_str(), "primary mode forced");
                self.request_mode(device, mode, ctx, commands);
            }
            DeviceRole::Assist => match self.timers.guard(mode, ctx.now_ms, ctx.global) {
                Ok(()) => {
                    info!(
                        device = %device.id,
                        mode = mode.as_str(),
                        preset = ctx.settings.preset.as_str(),
                        "assist mode set by preset"
                    );
                    self.request_mode(device, mode, ctx, commands);
                    self.timers.record_transition(ctx.now_ms);
                }
                Err(block) => {
                    debug!(device = %device.id, reason = %block.describe(), "preset change blocked");
                    self.target_hvac_mode = Some(mode);
                    self.blocked = Some(block);
                }
            },
        }
    }

    fn run_state_machine(
        &mut self,
        device: &DeviceConfig,
        observed: HvacMode,
        ctx: &TickContext<'_>,
        commands: &mut Vec<DeviceCommand>,
    ) {
        let intended = self.pending_mode.unwrap_or(observed);
        self.timers.advance(&ctx.inputs, ctx.global, ctx.elapsed_ms);

        match self.timers.decide(intended.is_on(), ctx.now_ms, ctx.global) {
            AssistDecision::Hold => {
                self.target_hvac_mode = self
                    .timers
                    .active_condition
                    .map(|condition| condition.target_mode())
                    .filter(|mode| *mode != intended);
            }
            AssistDecision::Transition { to, reason } => {
                info!(
                    device = %device.id,
                    mode = to.as_str(),
                    reason = reason.as_str(),
                    "automatic transition"
                );
                self.request_mode(device, to, ctx, commands);
                self.timers.record_transition(ctx.now_ms);
            }
            AssistDecision::Blocked { reason, block } => {
                debug!(
                    device = %device.id,
                    reason = reason.as_str(),
                    blocked = %block.describe(),
                    "automatic transition deferred"
                );
                self.target_hvac_mode = Some(block.to);
                self.blocked = Some(block);
            }
        }
    }

    fn apply_setpoint(
        &mut self,
        device: &DeviceConfig,
        budget_w: Option<f64>,
        ctx: &TickContext<'_>,
        commands: &mut Vec<DeviceCommand>,
    ) {
        let stale_ms = ctx.global.sensor_stale_timeout_ms;
        let device_temperature = self.fresh_temperature(ctx.now_ms, stale_ms);
        let target = ctx.inputs.target;
        let room_at_target = ctx
            .inputs
            .room_temperature
            .is_some_and(|room| room >= target);

        let budget_setpoint = match (ctx.settings.preset, budget_w) {
            (Preset::Solar, Some(budget_w)) => {
                let seed = self
                    .commanded_setpoint
                    .or(device_temperature)
                    .unwrap_or(target);
                let draw_w = self.fresh_power(ctx.now_ms, stale_ms);
                Some(self.stepper.next(budget_w, draw_w, seed, ctx.power, ctx.now_ms))
            }
            _ => None,
        };

        let (mode, source) =
            setpoint_mode(ctx.settings.preset, device.role, room_at_target, budget_setpoint);
        if !matches!(mode, SetpointMode::Power { .. }) {
            self.stepper.reset();
        }
        self.behavior = mode.behavior();

        let current = match source {
            TemperatureSource::Room => ctx.inputs.room_temperature,
            TemperatureSource::Device => device_temperature,
        };
        let Some(setpoint) = compute_setpoint(mode, current, target, device.offsets(), ctx.limits())
        else {
            debug!(device = %device.id, behavior = self.behavior.as_str(), "no usable reading, holding setpoint");
            return;
        };
        if matches!(mode, SetpointMode::Power { .. }) {
            self.stepper.settle(setpoint);
        }

        let changed = self
            .commanded_setpoint
            .map(|previous| (previous - setpoint).abs() >= SETPOINT_COMPARISON_THRESHOLD)
            .unwrap_or(true);
        if !changed {
            debug!(device = %device.id, setpoint, "setpoint unchanged");
            return;
        }
        if !cooled_down(
            self.last_setpoint_command_ms,
            ctx.now_ms,
            ctx.global.command_cooldown_ms,
        ) {
            debug!(device = %device.id, setpoint, "setpoint deferred by cooldown");
            return;
        }
        commands.push(DeviceCommand::SetTemperature {
            entity_id: device.climate_entity.clone(),
            temperature: setpoint,
        });
        self.commanded_setpoint = Some(setpoint);
        self.last_setpoint_command_ms = Some(ctx.now_ms);
    }
}

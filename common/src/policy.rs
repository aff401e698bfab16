use crate::{
    config::Offsets,
    types::{DeviceBehavior, DeviceRole, HvacMode, Preset},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetpointLimits {
    pub min: f64,
    pub max: f64,
}

/// How a running device's setpoint is derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetpointMode {
    /// Just below the sensed temperature so the device idles.
    Minimal,
    /// Room target, kept within the offset band around the sensed temperature.
    Setpoint,
    Boost,
    /// Setpoint produced by the power-budget stepper.
    Power { setpoint: f64 },
}

impl SetpointMode {
    pub fn behavior(self) -> DeviceBehavior {
        match self {
            Self::Minimal => DeviceBehavior::Minimal,
            Self::Setpoint => DeviceBehavior::Setpoint,
            Self::Boost => DeviceBehavior::Boost,
            Self::Power { .. } => DeviceBehavior::Power,
        }
    }
}

/// Which temperature a setpoint is computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureSource {
    Room,
    Device,
}

/// How the HVAC mode of a device is decided for the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeDirective {
    /// The mode belongs to the user; never commanded.
    Leave,
    /// The mode is dictated by the thermostat or preset.
    Force(HvacMode),
    /// The on/off state machine decides.
    Automatic,
}

/// Computes a clamped setpoint, or refuses when inputs are unusable.
///
/// The offset clamp is applied first, then the absolute limits. `current`
/// must be the reading the mode refers to; the result never leaves
/// `[limits.min, limits.max]`.
pub fn compute_setpoint(
    mode: SetpointMode,
    current: Option<f64>,
    target: f64,
    offsets: Offsets,
    limits: SetpointLimits,
) -> Option<f64> {
    if !target.is_finite() {
        return None;
    }
    let band = || {
        current
            .filter(|value| value.is_finite())
            .map(|value| (value + offsets.lower, value + offsets.upper))
    };
    let raw = match mode {
        SetpointMode::Minimal => band()?.0,
        SetpointMode::Setpoint => {
            let (floor, ceiling) = band()?;
            clamp_between(target, floor, ceiling)
        }
        SetpointMode::Boost => band()?.1,
        SetpointMode::Power { setpoint } => setpoint,
    };
    if !raw.is_finite() {
        return None;
    }
    Some(clamp_between(raw, limits.min, limits.max))
}

/// Like `f64::clamp` but never panics on an inverted range.
pub fn clamp_between(value: f64, low: f64, high: f64) -> f64 {
    value.max(low).min(high)
}

/// Mode ownership per role and preset while the thermostat is `thermostat`.
pub fn mode_directive(
    thermostat: HvacMode,
    preset: Preset,
    role: DeviceRole,
    allow_on_off_control: bool,
) -> ModeDirective {
    match (thermostat, role) {
        (HvacMode::Off, DeviceRole::Primary) => ModeDirective::Force(HvacMode::Off),
        (HvacMode::Off, DeviceRole::Assist) => ModeDirective::Leave,
        (HvacMode::Heat, DeviceRole::Primary) => ModeDirective::Force(HvacMode::Heat),
        (HvacMode::Heat, DeviceRole::Assist) if !allow_on_off_control => ModeDirective::Leave,
        (HvacMode::Heat, DeviceRole::Assist) => match preset {
            Preset::None | Preset::Solar => ModeDirective::Automatic,
            Preset::Boost => ModeDirective::Force(HvacMode::Heat),
            Preset::Away => ModeDirective::Force(HvacMode::Off),
        },
    }
}

/// Setpoint mode for a device that is currently running.
///
/// `room_at_target` only matters for assists without a preset.
/// `budget_setpoint` comes from the power stepper under `solar` and is absent
/// when no budget was allocated.
pub fn setpoint_mode(
    preset: Preset,
    role: DeviceRole,
    room_at_target: bool,
    budget_setpoint: Option<f64>,
) -> (SetpointMode, TemperatureSource) {
    match (preset, role) {
        (Preset::None, DeviceRole::Primary) => (SetpointMode::Setpoint, TemperatureSource::Room),
        (Preset::None, DeviceRole::Assist) if room_at_target => {
            (SetpointMode::Minimal, TemperatureSource::Device)
        }
        (Preset::None, DeviceRole::Assist) => (SetpointMode::Setpoint, TemperatureSource::Device),
        (Preset::Boost, _) => (SetpointMode::Boost, TemperatureSource::Device),
        (Preset::Away, _) => (SetpointMode::Minimal, TemperatureSource::Device),
        (Preset::Solar, _) => match budget_setpoint {
            Some(setpoint) => (SetpointMode::Power { setpoint }, TemperatureSource::Device),
            None => (SetpointMode::Minimal, TemperatureSource::Device),
        },
    }
}

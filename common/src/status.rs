use serde::Serialize;

/// Aggregate view published after every control tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub thermal: ThermalSummary,
    pub devices: Vec<DeviceStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThermalSummary {
    pub hvac_mode: &'static str,
    pub preset: &'static str,
    /// `off`, `idle`, `primary_only` or `assist`.
    pub mode: &'static str,
    pub target_temperature: f64,
    pub room_temperature: Option<f64>,
    pub room_average: Option<String>,
    pub delta: Option<f64>,
    pub room_derivative: Option<f64>,
    pub room_eta_minutes: Option<f64>,
    pub water_temperature: Option<f64>,
    pub water_derivative: Option<f64>,
    pub active_devices: Vec<String>,
    pub net_power_w: Option<f64>,
    pub surplus_w: Option<f64>,
    pub budget_total_w: Option<f64>,
    pub budget_remaining_w: Option<f64>,
    pub assist_timer_s: u64,
    pub on_eta_threshold_min: f64,
    pub off_eta_threshold_min: f64,
    pub min_on_s: u64,
    pub min_off_s: u64,
    pub persistence_degraded: bool,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub id: String,
    pub name: String,
    pub role: &'static str,
    pub climate_entity: String,
    pub available: bool,
    pub hvac_mode: Option<&'static str>,
    pub behavior: &'static str,
    pub automatic: bool,
    pub current_temperature: Option<f64>,
    pub temperature_derivative: Option<f64>,
    pub eta_minutes: Option<f64>,
    pub commanded_mode: Option<&'static str>,
    pub commanded_setpoint: Option<f64>,
    pub water_temperature: Option<f64>,
    pub power_w: Option<f64>,
    pub budget_w: Option<f64>,
    pub budget_override: bool,
    pub on_timer_s: u64,
    pub off_timer_s: u64,
    pub active_condition: Option<&'static str>,
    pub target_hvac_mode: Option<&'static str>,
    pub blocked: Option<String>,
    pub last_transition_ms: Option<u64>,
    pub summary: String,
}

impl DeviceStatus {
    /// One-line behavior string shown next to the device.
    pub fn describe(&self, assist_timer_ms: u64) -> String {
        let mut parts = vec![format!("{} ({}) {}", self.name, self.role, self.behavior)];

        if let Some(mode) = self.hvac_mode {
            parts.push(format!("HVAC {mode}"));
        }
        match (self.current_temperature, self.commanded_setpoint) {
            (Some(current), Some(setpoint)) => parts.push(format!(
                "Temps {}→{}",
                format_temperature(current),
                format_temperature(setpoint)
            )),
            (Some(current), None) => parts.push(format!("Temp {}", format_temperature(current))),
            _ => {}
        }
        if let Some(derivative) = self.temperature_derivative {
            parts.push(format!("ΔT {derivative:.1}°C/h"));
        }
        if let Some(eta) = self.eta_minutes {
            parts.push(format!("ETA {}", format_eta(eta)));
        }
        if let Some(water) = self.water_temperature {
            parts.push(format!("Water {}", format_temperature(water)));
        }
        if let Some(power) = self.power_w {
            parts.push(format!("Power {power:.0} W"));
        }
        if let Some(budget) = self.budget_w {
            let source = if self.budget_override { " (override)" } else { "" };
            parts.push(format!("Budget {budget:.0} W{source}"));
        }
        if self.automatic {
            let timer = if self.on_timer_s > 0 {
                Some(("ON", self.on_timer_s))
            } else if self.off_timer_s > 0 {
                Some(("OFF", self.off_timer_s))
            } else {
                None
            };
            if let Some((label, seconds)) = timer {
                let condition = self.active_condition.unwrap_or("-");
                parts.push(format!(
                    "{label} {} {condition}",
                    format_timer(seconds * 1_000, assist_timer_ms)
                ));
            }
        }
        if let Some(reason) = &self.blocked {
            parts.push(format!("blocked {reason}"));
        }

        parts.join(" | ")
    }
}

/// `elapsed/total` as `M:SS/M:SS`.
pub fn format_timer(elapsed_ms: u64, total_ms: u64) -> String {
    fn clock(ms: u64) -> String {
        let seconds = ms / 1_000;
        format!("{}:{:02}", seconds / 60, seconds % 60)
    }
    format!("{}/{}", clock(elapsed_ms.min(total_ms)), clock(total_ms))
}

pub fn format_eta(minutes: f64) -> String {
    if minutes >= 60.0 {
        format!("{:.1}h", minutes / 60.0)
    } else if minutes >= 1.0 {
        format!("{minutes:.0}m")
    } else {
        format!("{:.0}s", minutes * 60.0)
    }
}

pub fn format_temperature(value: f64) -> String {
    format!("{value:.1}°C")
}

/// `Avg room = avg(20.1°C 20.5°C) = 20.3°C`
pub fn format_room_average(values: &[f64], average: f64) -> String {
    let readings = values
        .iter()
        .map(|value| format_temperature(*value))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "Avg room = avg({readings}) = {}",
        format_temperature(average)
    )
}

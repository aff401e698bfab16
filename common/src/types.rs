use serde::{Deserialize, Serialize};

/// HVAC mode of the virtual thermostat and of every managed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HvacMode {
    Off,
    Heat,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Heat => "HEAT",
        }
    }

    /// Payload understood by climate entities on the command side.
    pub fn as_command(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Heat => "heat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "HEAT" | "ON" => Some(Self::Heat),
            "OFF" => Some(Self::Off),
            _ => None,
        }
    }

    /// Maps a climate entity's reported state onto on/off. Any mode other than
    /// `off` means the device is running; unavailable states map to `None`.
    pub fn from_reported(state: &str) -> Option<Self> {
        match state.trim().to_ascii_lowercase().as_str() {
            "" | "unavailable" | "unknown" | "none" => None,
            "off" => Some(Self::Off),
            _ => Some(Self::Heat),
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::Heat
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    #[default]
    None,
    Boost,
    Away,
    Solar,
}

impl Preset {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Boost => "boost",
            Self::Away => "away",
            Self::Solar => "solar",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Some(Self::None),
            "boost" => Some(Self::Boost),
            "away" => Some(Self::Away),
            "solar" => Some(Self::Solar),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Primary,
    Assist,
}

impl DeviceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Assist => "assist",
        }
    }
}

/// What a device is doing this tick, as reported in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBehavior {
    /// Never observed, or currently reporting unavailable.
    Unavailable,
    Off,
    /// Running under user control while the thermostat is off.
    Unmanaged,
    Minimal,
    Setpoint,
    Boost,
    Power,
}

impl DeviceBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Off => "off",
            Self::Unmanaged => "unmanaged",
            Self::Minimal => "minimal",
            Self::Setpoint => "setpoint",
            Self::Boost => "boost",
            Self::Power => "power",
        }
    }
}

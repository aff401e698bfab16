//! MQTT topic layout shared by the controller and anything bridging entity
//! state onto the broker.

/// Retained entity state is published under `powerclimate/state/<entity_id>`.
pub const TOPIC_STATE_PREFIX: &str = "powerclimate/state/";
pub const TOPIC_STATE_FILTER: &str = "powerclimate/state/#";

pub const TOPIC_SET_PREFIX: &str = "powerclimate/set/";

pub const TOPIC_CONTROLLER_STATE: &str = "powerclimate/controller/state";

pub const TOPIC_CMD_TARGET: &str = "powerclimate/cmnd/thermostat/target";
pub const TOPIC_CMD_MODE: &str = "powerclimate/cmnd/thermostat/mode";
pub const TOPIC_CMD_PRESET: &str = "powerclimate/cmnd/thermostat/preset";

/// `powerclimate/cmnd/device/<device_id>/mode` and `.../power_budget`.
pub const TOPIC_CMD_DEVICE_PREFIX: &str = "powerclimate/cmnd/device/";
pub const TOPIC_CMD_DEVICE_FILTER: &str = "powerclimate/cmnd/device/+/+";

pub fn state_topic(entity_id: &str) -> String {
    format!("{TOPIC_STATE_PREFIX}{entity_id}")
}

pub fn set_hvac_mode_topic(entity_id: &str) -> String {
    format!("{TOPIC_SET_PREFIX}{entity_id}/hvac_mode")
}

pub fn set_temperature_topic(entity_id: &str) -> String {
    format!("{TOPIC_SET_PREFIX}{entity_id}/temperature")
}

/// Entity id carried by a state topic.
pub fn entity_from_state_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_STATE_PREFIX)
        .filter(|entity_id| !entity_id.is_empty())
}

/// `(device_id, command)` from a per-device command topic.
pub fn parse_device_command_topic(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix(TOPIC_CMD_DEVICE_PREFIX)?;
    let (device_id, command) = rest.split_once('/')?;
    (!device_id.is_empty() && !command.is_empty() && !command.contains('/'))
        .then_some((device_id, command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_topics_round_trip_entity_ids() {
        let topic = state_topic("sensor.living_room_temperature");
        assert_eq!(
            entity_from_state_topic(&topic),
            Some("sensor.living_room_temperature")
        );
        assert_eq!(entity_from_state_topic("powerclimate/state/"), None);
        assert_eq!(entity_from_state_topic("other/state/sensor.x"), None);
    }

    #[test]
    fn device_command_topics_split_id_and_command() {
        assert_eq!(
            parse_device_command_topic("powerclimate/cmnd/device/hp2/mode"),
            Some(("hp2", "mode"))
        );
        assert_eq!(
            parse_device_command_topic("powerclimate/cmnd/device/hp2/power_budget/x"),
            None
        );
        assert_eq!(parse_device_command_topic("powerclimate/cmnd/device/hp2"), None);
    }

    #[test]
    fn set_topics_name_the_attribute() {
        assert_eq!(
            set_hvac_mode_topic("climate.hydro"),
            "powerclimate/set/climate.hydro/hvac_mode"
        );
        assert_eq!(
            set_temperature_topic("climate.hydro"),
            "powerclimate/set/climate.hydro/temperature"
        );
    }
}

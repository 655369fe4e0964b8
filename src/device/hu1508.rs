//! Philips Hu1508 humidifier/air-purifier model.
//!
//! The raw keys and value codes below are what the device reports over CoAP.

use super::{Admissible, AttributeSpec, DeviceModel, PropertyValue, RawStatus, RawValue, WriteSpec};
use tracing::warn;

pub const DEVICE_NAME: &str = "D01S03";
pub const POWER_STATUS: &str = "D03102";
pub const WORK_MODE: &str = "D0310C";
pub const HUMIDITY_TARGET: &str = "D03128";
pub const LAMP_MODE: &str = "D03135";
pub const AMBIENT_LIGHT_MODE: &str = "D03137";
pub const BRIGHTNESS: &str = "D03105";
pub const BEEP_STATUS: &str = "D03130";
pub const STANDBY_SENSORS: &str = "D03134";
pub const TEMPERATURE: &str = "D03224";
pub const HUMIDITY: &str = "D03125";
pub const FILTER_TOTAL_TIME: &str = "D05207";
pub const FILTER_REMAINING_TIME: &str = "D0520D";
pub const ERROR_CODE: &str = "D03240";
pub const RUNTIME: &str = "Runtime";

pub const ON_OFF: &[(&str, i64)] = &[("OFF", 0), ("ON", 1)];

pub const WORK_MODES: &[(&str, i64)] = &[("Auto", 0), ("Sleep", 17), ("Medium", 19), ("High", 65)];

// Lamp mode and ambient light share one value set: codes above 10 are
// ambient-light sub-modes, stored as lamp mode 2 plus `code - 10` in the
// ambient-light key.
pub const LAMP_MODES: &[(&str, i64)] = &[
    ("Off", 0),
    ("Humidity", 1),
    ("Warm", 11),
    ("Dawn", 12),
    ("Calm", 13),
    ("Breath", 14),
];
const AMBIENT_LIGHT_SELECTOR: i64 = 2;
const AMBIENT_LIGHT_SHIFT: i64 = 10;

pub const BRIGHTNESS_LEVELS: &[(&str, i64)] = &[("Bright", 123), ("Low", 115), ("Off", 0)];

pub const ERROR_CODES: &[(&str, i64)] =
    &[("NoError", 0), ("FillTank", -16128), ("CleanFilter", -16352)];

pub const HUMIDITY_TARGETS: &[i64] = &[40, 50, 60, 70];

pub static MODEL: DeviceModel = DeviceModel {
    name: "hu1508",
    attributes: &[
        AttributeSpec {
            name: "name",
            read: read_name,
            write: None,
        },
        AttributeSpec {
            name: "power_status",
            read: read_power_status,
            write: Some(WriteSpec {
                admissible: Admissible::Members(ON_OFF),
                forces_power_on: false,
                skip_when_unchanged: true,
                encode: encode_power_status,
            }),
        },
        AttributeSpec {
            name: "mode",
            read: read_mode,
            write: Some(WriteSpec {
                admissible: Admissible::Members(WORK_MODES),
                forces_power_on: true,
                skip_when_unchanged: false,
                encode: encode_mode,
            }),
        },
        AttributeSpec {
            name: "humidity_target",
            read: read_humidity_target,
            write: Some(WriteSpec {
                admissible: Admissible::Literals(HUMIDITY_TARGETS),
                forces_power_on: true,
                skip_when_unchanged: false,
                encode: encode_humidity_target,
            }),
        },
        AttributeSpec {
            name: "lamp_mode",
            read: read_lamp_mode,
            write: Some(WriteSpec {
                admissible: Admissible::Members(LAMP_MODES),
                forces_power_on: true,
                skip_when_unchanged: false,
                encode: encode_lamp_mode,
            }),
        },
        AttributeSpec {
            name: "brightness",
            read: read_brightness,
            write: Some(WriteSpec {
                admissible: Admissible::Members(BRIGHTNESS_LEVELS),
                forces_power_on: true,
                skip_when_unchanged: false,
                encode: encode_brightness,
            }),
        },
        AttributeSpec {
            name: "preferences_beep",
            read: read_preferences_beep,
            write: Some(WriteSpec {
                admissible: Admissible::Members(ON_OFF),
                forces_power_on: false,
                skip_when_unchanged: false,
                encode: encode_preferences_beep,
            }),
        },
        AttributeSpec {
            name: "preferences_sensors_in_standby",
            read: read_preferences_sensors_in_standby,
            write: Some(WriteSpec {
                admissible: Admissible::Members(ON_OFF),
                forces_power_on: false,
                skip_when_unchanged: false,
                encode: encode_preferences_sensors_in_standby,
            }),
        },
        AttributeSpec {
            name: "temperature",
            read: read_temperature,
            write: None,
        },
        AttributeSpec {
            name: "humidity",
            read: read_humidity,
            write: None,
        },
        AttributeSpec {
            name: "percent_unit_before_cleaning",
            read: read_percent_unit_before_cleaning,
            write: None,
        },
        AttributeSpec {
            name: "error",
            read: read_error,
            write: None,
        },
        AttributeSpec {
            name: "runtime_seconds",
            read: read_runtime_seconds,
            write: None,
        },
    ],
};

fn int_key(raw: &RawStatus, key: &str, default: i64) -> i64 {
    match raw.get(key) {
        Some(RawValue::Int(value)) => *value,
        Some(RawValue::Float(value)) => *value as i64,
        _ => default,
    }
}

/// Decodes a wire code into its member name; unmapped codes fall back to the
/// raw integer so a single odd value cannot fail the whole status.
fn member_value(members: &'static [(&'static str, i64)], code: i64) -> PropertyValue {
    match members.iter().find(|(_, member)| *member == code) {
        Some((name, _)) => PropertyValue::Member(name),
        None => {
            warn!("Found unmapped value code: {}", code);
            PropertyValue::Int(code)
        }
    }
}

fn read_name(raw: &RawStatus) -> PropertyValue {
    match raw.get(DEVICE_NAME) {
        Some(RawValue::Text(name)) => PropertyValue::Text(name.clone()),
        _ => PropertyValue::Text("Unknown".to_string()),
    }
}

fn read_power_status(raw: &RawStatus) -> PropertyValue {
    member_value(ON_OFF, int_key(raw, POWER_STATUS, 0))
}

fn read_mode(raw: &RawStatus) -> PropertyValue {
    member_value(WORK_MODES, int_key(raw, WORK_MODE, 0))
}

fn read_humidity_target(raw: &RawStatus) -> PropertyValue {
    PropertyValue::Int(int_key(raw, HUMIDITY_TARGET, 40))
}

fn read_lamp_mode(raw: &RawStatus) -> PropertyValue {
    let lamp_mode = int_key(raw, LAMP_MODE, 0);
    if lamp_mode == AMBIENT_LIGHT_SELECTOR {
        member_value(
            LAMP_MODES,
            int_key(raw, AMBIENT_LIGHT_MODE, 0) + AMBIENT_LIGHT_SHIFT,
        )
    } else {
        member_value(LAMP_MODES, lamp_mode)
    }
}

fn read_brightness(raw: &RawStatus) -> PropertyValue {
    member_value(BRIGHTNESS_LEVELS, int_key(raw, BRIGHTNESS, 0))
}

fn read_preferences_beep(raw: &RawStatus) -> PropertyValue {
    member_value(ON_OFF, int_key(raw, BEEP_STATUS, 1))
}

fn read_preferences_sensors_in_standby(raw: &RawStatus) -> PropertyValue {
    member_value(ON_OFF, int_key(raw, STANDBY_SENSORS, 1))
}

fn read_temperature(raw: &RawStatus) -> PropertyValue {
    // Reported in deci-degrees
    PropertyValue::Int(int_key(raw, TEMPERATURE, 0) / 10)
}

fn read_humidity(raw: &RawStatus) -> PropertyValue {
    PropertyValue::Int(int_key(raw, HUMIDITY, 0))
}

fn read_percent_unit_before_cleaning(raw: &RawStatus) -> PropertyValue {
    let remaining = int_key(raw, FILTER_REMAINING_TIME, 200);
    let total = int_key(raw, FILTER_TOTAL_TIME, 200);
    if total <= 0 {
        return PropertyValue::Float(100.0);
    }
    let percent = remaining as f64 / total as f64 * 100.0;
    PropertyValue::Float((percent * 100.0).round() / 100.0)
}

fn read_error(raw: &RawStatus) -> PropertyValue {
    let code = int_key(raw, ERROR_CODE, 100);
    if code == 0 {
        return PropertyValue::Empty;
    }
    match ERROR_CODES.iter().find(|(_, error)| *error == code) {
        Some((name, _)) => PropertyValue::Member(name),
        None => {
            warn!("Found unmapped error code: {}", code);
            PropertyValue::Int(code)
        }
    }
}

fn read_runtime_seconds(raw: &RawStatus) -> PropertyValue {
    // Runtime is expressed in milliseconds
    PropertyValue::Int(int_key(raw, RUNTIME, 0) / 1000)
}

fn encode_power_status(code: i64) -> Vec<(&'static str, RawValue)> {
    vec![(POWER_STATUS, RawValue::Int(code))]
}

fn encode_mode(code: i64) -> Vec<(&'static str, RawValue)> {
    vec![(WORK_MODE, RawValue::Int(code))]
}

fn encode_humidity_target(code: i64) -> Vec<(&'static str, RawValue)> {
    vec![(HUMIDITY_TARGET, RawValue::Int(code))]
}

fn encode_lamp_mode(code: i64) -> Vec<(&'static str, RawValue)> {
    if code > AMBIENT_LIGHT_SHIFT {
        vec![
            (LAMP_MODE, RawValue::Int(AMBIENT_LIGHT_SELECTOR)),
            (AMBIENT_LIGHT_MODE, RawValue::Int(code - AMBIENT_LIGHT_SHIFT)),
        ]
    } else {
        vec![
            (LAMP_MODE, RawValue::Int(code)),
            (AMBIENT_LIGHT_MODE, RawValue::Int(0)),
        ]
    }
}

fn encode_brightness(code: i64) -> Vec<(&'static str, RawValue)> {
    vec![(BRIGHTNESS, RawValue::Int(code))]
}

fn encode_preferences_beep(code: i64) -> Vec<(&'static str, RawValue)> {
    vec![(BEEP_STATUS, RawValue::Int(code))]
}

fn encode_preferences_sensors_in_standby(code: i64) -> Vec<(&'static str, RawValue)> {
    vec![(STANDBY_SENSORS, RawValue::Int(code))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, DeviceState};

    fn state() -> DeviceState {
        DeviceState::new(&MODEL)
    }

    fn state_with(entries: &[(&str, RawValue)]) -> DeviceState {
        let mut state = state();
        let mut raw = RawStatus::new();
        for (key, value) in entries {
            raw.insert((*key).to_string(), value.clone());
        }
        state.replace_raw(raw);
        state
    }

    #[test]
    fn temperature_is_reported_in_deci_degrees() {
        let state = state_with(&[(TEMPERATURE, RawValue::Int(215))]);
        assert_eq!(state.read("temperature"), Some(PropertyValue::Int(21)));
    }

    #[test]
    fn runtime_is_reported_in_milliseconds() {
        let state = state_with(&[(RUNTIME, RawValue::Int(90500))]);
        assert_eq!(state.read("runtime_seconds"), Some(PropertyValue::Int(90)));
    }

    #[test]
    fn filter_percent_defaults_to_full() {
        assert_eq!(
            state().read("percent_unit_before_cleaning"),
            Some(PropertyValue::Float(100.0))
        );
    }

    #[test]
    fn filter_percent_is_rounded() {
        let state = state_with(&[
            (FILTER_TOTAL_TIME, RawValue::Int(4800)),
            (FILTER_REMAINING_TIME, RawValue::Int(1234)),
        ]);
        assert_eq!(
            state.read("percent_unit_before_cleaning"),
            Some(PropertyValue::Float(25.71))
        );
    }

    #[test]
    fn error_decodes_known_codes() {
        let state = state_with(&[(ERROR_CODE, RawValue::Int(0))]);
        assert_eq!(state.read("error"), Some(PropertyValue::Empty));
        let state = state_with(&[(ERROR_CODE, RawValue::Int(-16128))]);
        assert_eq!(state.read("error"), Some(PropertyValue::Member("FillTank")));
    }

    #[test]
    fn error_falls_back_to_raw_code() {
        let state = state_with(&[(ERROR_CODE, RawValue::Int(-9999))]);
        assert_eq!(state.read("error"), Some(PropertyValue::Int(-9999)));
    }

    #[test]
    fn missing_keys_decode_to_defaults() {
        let state = state();
        assert_eq!(
            state.read("name"),
            Some(PropertyValue::Text("Unknown".to_string()))
        );
        assert_eq!(state.read("power_status"), Some(PropertyValue::Member("OFF")));
        assert_eq!(state.read("mode"), Some(PropertyValue::Member("Auto")));
        assert_eq!(state.read("humidity_target"), Some(PropertyValue::Int(40)));
        assert_eq!(state.read("lamp_mode"), Some(PropertyValue::Member("Off")));
        assert_eq!(
            state.read("preferences_beep"),
            Some(PropertyValue::Member("ON"))
        );
    }

    #[test]
    fn lamp_mode_round_trips_every_member() {
        for (name, _) in LAMP_MODES {
            let mut state = state();
            state.write("lamp_mode", name).unwrap();
            assert_eq!(state.read("lamp_mode"), Some(PropertyValue::Member(name)));
        }
    }

    #[test]
    fn ambient_light_write_from_powered_off() {
        let mut state = state_with(&[
            (POWER_STATUS, RawValue::Int(0)),
            (LAMP_MODE, RawValue::Int(0)),
        ]);
        state.write("lamp_mode", "Warm").unwrap();

        let commands = state.drain_commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].len(), 1);
        assert_eq!(commands[0][POWER_STATUS], RawValue::Int(1));
        assert_eq!(commands[1].len(), 2);
        assert_eq!(commands[1][LAMP_MODE], RawValue::Int(2));
        assert_eq!(commands[1][AMBIENT_LIGHT_MODE], RawValue::Int(1));
        assert_eq!(state.read("lamp_mode"), Some(PropertyValue::Member("Warm")));
    }

    #[test]
    fn mode_write_forces_power_on_first() {
        let mut state = state_with(&[(POWER_STATUS, RawValue::Int(0))]);
        state.write("mode", "Sleep").unwrap();

        let commands = state.drain_commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0][POWER_STATUS], RawValue::Int(1));
        assert_eq!(commands[1][WORK_MODE], RawValue::Int(17));
        assert_eq!(state.read("power_status"), Some(PropertyValue::Member("ON")));
    }

    #[test]
    fn mode_write_on_powered_device_skips_power_command() {
        let mut state = state_with(&[(POWER_STATUS, RawValue::Int(1))]);
        state.write("mode", "High").unwrap();

        let commands = state.drain_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0][WORK_MODE], RawValue::Int(65));
    }

    #[test]
    fn power_write_by_name_matches_current_state() {
        let mut state = state();
        state.write("power_status", "ON").unwrap();
        assert_eq!(state.read("power_status"), Some(PropertyValue::Member("ON")));
        let commands = state.drain_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0][POWER_STATUS], RawValue::Int(1));

        // Repeating the same write is a no-op
        state.write("power_status", "ON").unwrap();
        assert!(state.drain_commands().is_empty());
    }

    #[test]
    fn beep_write_does_not_touch_power() {
        let mut state = state_with(&[(POWER_STATUS, RawValue::Int(0))]);
        state.write("preferences_beep", "OFF").unwrap();

        let commands = state.drain_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0][BEEP_STATUS], RawValue::Int(0));
        assert_eq!(state.read("power_status"), Some(PropertyValue::Member("OFF")));
    }

    #[test]
    fn humidity_target_validates_literals() {
        let mut state = state_with(&[(POWER_STATUS, RawValue::Int(1))]);
        state.write("humidity_target", "60").unwrap();
        assert_eq!(state.read("humidity_target"), Some(PropertyValue::Int(60)));
        assert_eq!(state.drain_commands().len(), 1);

        assert!(matches!(
            state.write("humidity_target", "55"),
            Err(DeviceError::InvalidValue { .. })
        ));
        assert!(state.drain_commands().is_empty());
    }

    #[test]
    fn write_rejects_bad_names_and_read_only_attributes() {
        let mut state = state();
        assert!(matches!(
            state.write("power_status", "on"),
            Err(DeviceError::InvalidValue { .. })
        ));
        assert!(matches!(
            state.write("temperature", "21"),
            Err(DeviceError::ReadOnly(_))
        ));
        assert!(matches!(
            state.write("no_such_attribute", "1"),
            Err(DeviceError::UnknownAttribute(_))
        ));
    }

    #[test]
    fn admissible_values_follow_the_attribute_kind() {
        let state = state();
        let modes = state.admissible_values("mode").unwrap();
        assert_eq!(modes, vec!["Auto", "Sleep", "Medium", "High"]);
        let targets = state.admissible_values("humidity_target").unwrap();
        assert_eq!(targets, vec!["40", "50", "60", "70"]);
        assert!(state.admissible_values("temperature").is_none());
        assert!(state.admissible_values("nope").is_none());
    }

    #[test]
    fn as_dict_keeps_declaration_order() {
        let state = state_with(&[
            (DEVICE_NAME, RawValue::Text("Foo".to_string())),
            (TEMPERATURE, RawValue::Int(215)),
        ]);
        let dict = state.as_dict();
        assert_eq!(dict.first().unwrap().0, "name");
        assert_eq!(dict.last().unwrap().0, "runtime_seconds");
        let temperature = dict
            .iter()
            .find(|(name, _)| *name == "temperature")
            .map(|(_, value)| value.clone());
        assert_eq!(temperature, Some(PropertyValue::Int(21)));
    }
}

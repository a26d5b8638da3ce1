//! Home Assistant MQTT discovery messages.
//!
//! Each entity is announced once with a retained configuration message pointing at the topics
//! the bridge publishes on. Consumers treat an entity as offline once its state topic has been
//! silent for `expire_after`.

use crate::mqtt::Topics;
use crate::projector::MODE_KEY;
use crate::registers::FanMode;
use std::time::Duration;

pub const DEFAULT_EXPIRE_AFTER: Duration = Duration::from_secs(4800);

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantityKind {
    Temperature,
    Humidity,
    Mode,
}

impl QuantityKind {
    fn unit(self) -> Option<&'static str> {
        match self {
            QuantityKind::Temperature => Some("°C"),
            QuantityKind::Humidity => Some("%"),
            QuantityKind::Mode => None,
        }
    }

    fn device_class(self) -> Option<&'static str> {
        match self {
            QuantityKind::Temperature => Some("temperature"),
            QuantityKind::Humidity => Some("humidity"),
            QuantityKind::Mode => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StateSource {
    Sensors,
    Status,
}

/// A sensor entity exposed to the home automation frontend.
#[derive(Clone, Copy, Debug)]
pub struct EntityDescriptor {
    pub name: &'static str,
    /// Key in the published JSON view holding the entity's value.
    pub value_key: &'static str,
    pub kind: QuantityKind,
    source: StateSource,
}

const fn sensor(name: &'static str, value_key: &'static str, kind: QuantityKind) -> EntityDescriptor {
    EntityDescriptor { name, value_key, kind, source: StateSource::Sensors }
}

pub static ENTITIES: [EntityDescriptor; 6] = [
    sensor("Fresh Air Temperature", "Fresh Air Temperature", QuantityKind::Temperature),
    sensor(
        "Supply air before re-heater temperature",
        "Supply air before re-heater temperature",
        QuantityKind::Temperature,
    ),
    sensor("Supply air temperature", "Supply air temperature", QuantityKind::Temperature),
    sensor("Exhaust air temperature", "Extract air temperature", QuantityKind::Temperature),
    sensor("Humidity", "RH", QuantityKind::Humidity),
    EntityDescriptor {
        name: "Mode",
        value_key: MODE_KEY,
        kind: QuantityKind::Mode,
        source: StateSource::Status,
    },
];

#[derive(serde::Serialize)]
struct SensorConfig<'a> {
    name: &'a str,
    unique_id: String,
    state_topic: &'a str,
    value_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    expire_after: u64,
}

#[derive(serde::Serialize)]
struct ClimateConfig<'a> {
    name: &'a str,
    current_temperature_topic: &'a str,
    current_temperature_template: &'a str,
    current_humidity_topic: &'a str,
    current_humidity_template: &'a str,
    temperature_command_topic: &'a str,
    temperature_state_topic: &'a str,
    temperature_state_template: &'a str,
    mode_state_topic: &'a str,
    modes: &'a [&'a str],
    fan_modes: &'a [&'a str],
    fan_mode_state_topic: &'a str,
    fan_mode_state_template: &'a str,
    fan_mode_command_topic: &'a str,
    min_temp: u8,
    max_temp: u8,
    temp_step: u8,
}

fn object_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// The retained messages registering every entity, as `(topic, payload)` pairs.
pub fn registration_messages(
    prefix: &str,
    topics: &Topics,
    expire_after: Duration,
) -> Result<Vec<(String, Vec<u8>)>, serde_json::Error> {
    let mut messages = Vec::with_capacity(ENTITIES.len() + 2);
    for entity in &ENTITIES {
        let id = object_id(entity.name);
        let config = SensorConfig {
            name: entity.name,
            unique_id: format!("{}_{id}", topics.base),
            state_topic: match entity.source {
                StateSource::Sensors => &topics.sensors,
                StateSource::Status => &topics.status,
            },
            value_template: format!("{{{{ value_json[\"{}\"] }}}}", entity.value_key),
            device_class: entity.kind.device_class(),
            unit_of_measurement: entity.kind.unit(),
            expire_after: expire_after.as_secs(),
        };
        messages.push((
            format!("{prefix}/sensor/{}/{id}/config", topics.base),
            serde_json::to_vec(&config)?,
        ));
    }

    let mode_topic = format!("{}/system/mode", topics.base);
    let climate = ClimateConfig {
        name: "Swegon Ventilation",
        current_temperature_topic: &topics.sensors,
        current_temperature_template: r#"{{ value_json["Supply air temperature"]}}"#,
        current_humidity_topic: &topics.sensors,
        current_humidity_template: r#"{{ value_json["RH"]}}"#,
        temperature_command_topic: &topics.temp_set,
        temperature_state_topic: &topics.settings,
        temperature_state_template: r#"{{ value_json["Temperature setpoint"]}}"#,
        mode_state_topic: &mode_topic,
        modes: &["auto"],
        fan_modes: FanMode::labels(),
        fan_mode_state_topic: &topics.status,
        fan_mode_state_template: r#"{{ value_json["Mode"]}}"#,
        fan_mode_command_topic: &topics.fan_set,
        min_temp: 13,
        max_temp: 25,
        temp_step: 1,
    };
    messages.push((format!("{prefix}/climate/{}/config", topics.base), serde_json::to_vec(&climate)?));
    messages.push((mode_topic, b"auto".to_vec()));
    Ok(messages)
}

//! Turns the register tables into the four views published on the bus.

use crate::registers::{FanMode, RegisterTable, Tables, Value};
use serde::ser::SerializeMap as _;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

pub const MODE_KEY: &str = "Mode";
pub const UPTIME_KEY: &str = "Controller uptime";
pub const ALARMS_KEY: &str = "Alarms";
const OPERATING_MODE: &str = "Operating Mode";

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Field {
    Value(Value),
    Text(String),
}

/// A view with keys in sorted order.
pub type View = BTreeMap<&'static str, Field>;

/// Sensor readings in catalog order.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorsView(pub Vec<(&'static str, Value)>);

impl serde::Serialize for SensorsView {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Views {
    pub settings: View,
    pub status: View,
    pub sensors: SensorsView,
    pub alarms: View,
}

fn flat(table: &RegisterTable) -> View {
    table.entries().iter().map(|e| (e.name, Field::Value(e.last_value))).collect()
}

/// `H:MM`, hours are not wrapped into days.
pub fn format_uptime(uptime: Duration) -> String {
    let minutes = uptime.as_secs() / 60;
    format!("{}:{:02}", minutes / 60, minutes % 60)
}

/// Names of the active alarms in table order, or `None`.
pub fn alarm_summary(alarms: &RegisterTable) -> String {
    let active = alarms
        .entries()
        .iter()
        .filter(|e| e.last_value.is_active())
        .map(|e| e.name)
        .collect::<Vec<_>>();
    if active.is_empty() { "None".to_string() } else { active.join(", ") }
}

pub struct StateProjector {
    started: Instant,
    last_mode: Option<FanMode>,
}

impl StateProjector {
    pub fn new() -> Self {
        Self { started: Instant::now(), last_mode: None }
    }

    pub fn project(&mut self, tables: &Tables) -> Views {
        self.project_with_uptime(tables, self.started.elapsed())
    }

    pub fn project_with_uptime(&mut self, tables: &Tables, uptime: Duration) -> Views {
        let mut status = flat(&tables.status);
        match tables.status.value_of(OPERATING_MODE).map(|v| (v, FanMode::from_value(v))) {
            Some((_, Some(mode))) => self.last_mode = Some(mode),
            Some((value, None)) => {
                tracing::warn!(%value, last_known = ?self.last_mode, "device reports an unknown fan mode");
            }
            None => {}
        }
        if let Some(mode) = self.last_mode {
            status.insert(MODE_KEY, Field::Text(mode.label().to_string()));
        }
        status.insert(UPTIME_KEY, Field::Text(format_uptime(uptime)));

        let mut alarms = flat(&tables.alarms);
        alarms.insert(ALARMS_KEY, Field::Text(alarm_summary(&tables.alarms)));

        let sensors =
            SensorsView(tables.sensors.entries().iter().map(|e| (e.name, e.last_value)).collect());

        Views { settings: flat(&tables.settings), status, sensors, alarms }
    }
}

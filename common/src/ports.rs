//! Boundary traits between the control core and the outside world.
//!
//! Adapters (MQTT state store, learning engine, event bus) implement these;
//! the core reads and commands devices only through them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::Result, types::HvacMode};

/// Raw state of one entity as the external store reports it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityState {
    pub value: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl EntityState {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_updated = Some(at);
        self
    }

    pub fn is_unavailable(&self) -> bool {
        let value = self.value.trim();
        value.is_empty()
            || value.eq_ignore_ascii_case("unknown")
            || value.eq_ignore_ascii_case("unavailable")
    }

    pub fn numeric_value(&self) -> Option<f32> {
        if self.is_unavailable() {
            return None;
        }
        self.value.trim().parse::<f32>().ok().filter(|v| v.is_finite())
    }

    pub fn attribute_f32(&self, key: &str) -> Option<f32> {
        let value = match self.attributes.get(key)? {
            Value::Number(number) => number.as_f64().map(|v| v as f32),
            Value::String(text) => text.trim().parse::<f32>().ok(),
            _ => None,
        };
        value.filter(|v| v.is_finite())
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// True for "on"-like binary states (open window, someone home).
    pub fn is_on(&self) -> bool {
        matches!(
            self.value.trim().to_ascii_lowercase().as_str(),
            "on" | "open" | "true" | "home" | "detected" | "1"
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeviceCommand {
    TurnOn,
    TurnOff,
    SetTemperature { temperature: f32 },
    SetPosition { position: f32 },
    SetHvacMode { hvac_mode: HvacMode },
}

impl DeviceCommand {
    pub fn action(&self) -> &'static str {
        match self {
            Self::TurnOn => "turn_on",
            Self::TurnOff => "turn_off",
            Self::SetTemperature { .. } => "set_temperature",
            Self::SetPosition { .. } => "set_position",
            Self::SetHvacMode { .. } => "set_hvac_mode",
        }
    }
}

pub trait StateStore: Send + Sync {
    fn get_state(&self, entity_id: &str) -> Option<EntityState>;

    /// Issue a command without waiting for the device to acknowledge it.
    fn command(&self, entity_id: &str, command: &DeviceCommand) -> Result<()>;
}

/// Predicts warm-up durations from past heating events.
pub trait LearningEngine: Send + Sync {
    fn predict_heating_minutes(
        &self,
        zone_id: &str,
        current_temp: f32,
        target_temp: f32,
        outdoor_temp: Option<f32>,
    ) -> Option<u32>;

    fn start_heating_event(&self, zone_id: &str, current_temp: f32);

    fn end_heating_event(&self, zone_id: &str, current_temp: f32);
}

/// Learning engine that never predicts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLearning;

impl LearningEngine for NoLearning {
    fn predict_heating_minutes(&self, _: &str, _: f32, _: f32, _: Option<f32>) -> Option<u32> {
        None
    }

    fn start_heating_event(&self, _: &str, _: f32) {}

    fn end_heating_event(&self, _: &str, _: f32) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    StateChange,
    ScheduleApplied,
    Protection,
    Boost,
    Preheat,
    Actuation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneEvent {
    pub zone_id: String,
    pub category: EventCategory,
    pub message: String,
    pub fields: Map<String, Value>,
}

impl ZoneEvent {
    pub fn new(zone_id: &str, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.to_string(),
            category,
            message: message.into(),
            fields: Map::new(),
        }
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ZoneEvent);
}

/// Everything a control cycle talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub store: &'a dyn StateStore,
    pub learning: &'a dyn LearningEngine,
    pub events: &'a dyn EventSink,
}

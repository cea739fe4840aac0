use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::HeatingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacMode {
    #[default]
    Heat,
    Off,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heat => "heat",
            Self::Off => "off",
        }
    }
}

impl FromStr for HvacMode {
    type Err = HeatingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "heat" => Ok(Self::Heat),
            "off" => Ok(Self::Off),
            other => Err(HeatingError::validation(format!(
                "hvac mode '{other}' (expected heat or off)"
            ))),
        }
    }
}

/// Outcome of the hysteresis decision for one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneState {
    Heating,
    #[default]
    Idle,
    Off,
    Manual,
}

impl ZoneState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heating => "heating",
            Self::Idle => "idle",
            Self::Off => "off",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetMode {
    #[default]
    None,
    Away,
    Eco,
    Comfort,
    Home,
    Sleep,
    Activity,
    Boost,
}

impl PresetMode {
    pub const ALL: [PresetMode; 8] = [
        Self::None,
        Self::Away,
        Self::Eco,
        Self::Comfort,
        Self::Home,
        Self::Sleep,
        Self::Activity,
        Self::Boost,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Away => "away",
            Self::Eco => "eco",
            Self::Comfort => "comfort",
            Self::Home => "home",
            Self::Sleep => "sleep",
            Self::Activity => "activity",
            Self::Boost => "boost",
        }
    }

    pub fn is_none(self) -> bool {
        self == Self::None
    }
}

impl fmt::Display for PresetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresetMode {
    type Err = HeatingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lower = value.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_str() == lower)
            .ok_or_else(|| HeatingError::validation(format!("unknown preset mode '{value}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Thermostat,
    TemperatureSensor,
    Switch,
    Valve,
    OpenthermGateway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAction {
    #[default]
    TurnOff,
    ReduceTemperature,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatingSystemType {
    #[default]
    Radiator,
    Underfloor,
}

/// Why the effective target ended up where it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSource {
    Boost,
    Window,
    Preset,
    Schedule,
    Base,
}

/// Published per-zone view, refreshed every cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneStatus {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub state: ZoneState,
    #[serde(rename = "hvacMode")]
    pub hvac_mode: HvacMode,
    #[serde(rename = "presetMode")]
    pub preset_mode: PresetMode,
    #[serde(rename = "currentTemp")]
    pub current_temperature: Option<f32>,
    #[serde(rename = "baseTarget")]
    pub base_target_temperature: f32,
    #[serde(rename = "effectiveTarget")]
    pub effective_target_temperature: f32,
    #[serde(rename = "targetSource")]
    pub target_source: TargetSource,
    pub hysteresis: f32,
    #[serde(rename = "manualOverride")]
    pub manual_override: bool,
    #[serde(rename = "boostActive")]
    pub boost_active: bool,
    #[serde(rename = "boostRemainingMin")]
    pub boost_remaining_min: i64,
    #[serde(rename = "activeSchedule")]
    pub active_schedule: Option<String>,
    #[serde(rename = "nextScheduleEventEpoch")]
    pub next_schedule_event_epoch: Option<i64>,
    #[serde(rename = "actuationFailures")]
    pub actuation_failures: usize,
}

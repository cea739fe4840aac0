//! Zone data model.
//!
//! A zone serializes to the JSON shape the zone store persists. Older
//! stores kept window and presence sensors as plain entity-id lists; those
//! are upgraded to the structured form on load.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    config::{GlobalSettings, PresetTemperatures},
    error::{HeatingError, Result},
    schedule::{ClockTime, Schedule},
    types::{DeviceKind, HvacMode, PresetMode, WindowAction},
};

const DEFAULT_WINDOW_DROP: f32 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    #[serde(default)]
    pub source_topic: String,
}

impl DeviceEntry {
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            source_topic: String::new(),
        }
    }

    /// State-store entity for this device; falls back to the device id.
    pub fn entity<'a>(&'a self, device_id: &'a str) -> &'a str {
        if self.source_topic.is_empty() {
            device_id
        } else {
            &self.source_topic
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSensor {
    pub sensor_id: String,
    #[serde(default)]
    pub action: WindowAction,
    #[serde(default = "default_window_drop")]
    pub temp_drop: f32,
}

fn default_window_drop() -> f32 {
    DEFAULT_WINDOW_DROP
}

impl WindowSensor {
    pub fn new(sensor_id: impl Into<String>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            action: WindowAction::TurnOff,
            temp_drop: DEFAULT_WINDOW_DROP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSensor {
    pub sensor_id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyOr<T> {
    Legacy(String),
    Structured(T),
}

fn window_sensors<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<WindowSensor>, D::Error> {
    let raw = Vec::<LegacyOr<WindowSensor>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|entry| match entry {
            LegacyOr::Legacy(sensor_id) => WindowSensor::new(sensor_id),
            LegacyOr::Structured(sensor) => sensor,
        })
        .collect())
}

fn presence_sensors<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<PresenceSensor>, D::Error> {
    let raw = Vec::<LegacyOr<PresenceSensor>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|entry| match entry {
            LegacyOr::Legacy(sensor_id) => PresenceSensor { sensor_id },
            LegacyOr::Structured(sensor) => sensor,
        })
        .collect())
}

/// Zone-local preset temperatures, each optionally deferring to the global value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZonePresets {
    pub away_temp: f32,
    pub eco_temp: f32,
    pub comfort_temp: f32,
    pub home_temp: f32,
    pub sleep_temp: f32,
    pub activity_temp: f32,
    pub use_global_away: bool,
    pub use_global_eco: bool,
    pub use_global_comfort: bool,
    pub use_global_home: bool,
    pub use_global_sleep: bool,
    pub use_global_activity: bool,
}

impl Default for ZonePresets {
    fn default() -> Self {
        let globals = PresetTemperatures::default();
        Self {
            away_temp: globals.away,
            eco_temp: globals.eco,
            comfort_temp: globals.comfort,
            home_temp: globals.home,
            sleep_temp: globals.sleep,
            activity_temp: globals.activity,
            use_global_away: true,
            use_global_eco: true,
            use_global_comfort: true,
            use_global_home: true,
            use_global_sleep: true,
            use_global_activity: true,
        }
    }
}

impl ZonePresets {
    /// `(local temperature, use global)` for a non-boost preset.
    fn slot(&self, preset: PresetMode) -> Option<(f32, bool)> {
        match preset {
            PresetMode::Away => Some((self.away_temp, self.use_global_away)),
            PresetMode::Eco => Some((self.eco_temp, self.use_global_eco)),
            PresetMode::Comfort => Some((self.comfort_temp, self.use_global_comfort)),
            PresetMode::Home => Some((self.home_temp, self.use_global_home)),
            PresetMode::Sleep => Some((self.sleep_temp, self.use_global_sleep)),
            PresetMode::Activity => Some((self.activity_temp, self.use_global_activity)),
            PresetMode::None | PresetMode::Boost => None,
        }
    }

    pub fn set_local(&mut self, preset: PresetMode, temperature: f32) -> Result<()> {
        let (temp, use_global) = match preset {
            PresetMode::Away => (&mut self.away_temp, &mut self.use_global_away),
            PresetMode::Eco => (&mut self.eco_temp, &mut self.use_global_eco),
            PresetMode::Comfort => (&mut self.comfort_temp, &mut self.use_global_comfort),
            PresetMode::Home => (&mut self.home_temp, &mut self.use_global_home),
            PresetMode::Sleep => (&mut self.sleep_temp, &mut self.use_global_sleep),
            PresetMode::Activity => (&mut self.activity_temp, &mut self.use_global_activity),
            PresetMode::None | PresetMode::Boost => {
                return Err(HeatingError::validation(format!(
                    "preset '{preset}' has no zone temperature"
                )))
            }
        };
        *temp = temperature;
        *use_global = false;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostState {
    pub active: bool,
    /// Minutes.
    pub duration: u32,
    pub temperature: f32,
    pub end_time: Option<DateTime<Utc>>,
}

impl Default for BoostState {
    fn default() -> Self {
        Self {
            active: false,
            duration: 60,
            temperature: PresetTemperatures::default().boost,
            end_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NightBoost {
    pub enabled: bool,
    pub offset: f32,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
}

impl Default for NightBoost {
    fn default() -> Self {
        Self {
            enabled: false,
            offset: 0.5,
            start_time: ClockTime::from_hm(22, 0).unwrap_or(ClockTime::MIDNIGHT),
            end_time: ClockTime::from_hm(6, 0).unwrap_or(ClockTime::MIDNIGHT),
        }
    }
}

impl NightBoost {
    /// Whether `now` falls inside the window, which may cross midnight.
    pub fn is_active_at(&self, now: ClockTime) -> bool {
        if !self.enabled {
            return false;
        }
        if self.start_time <= self.end_time {
            self.start_time <= now && now < self.end_time
        } else {
            now >= self.start_time || now < self.end_time
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartNightBoost {
    pub enabled: bool,
    pub target_time: ClockTime,
    pub weather_source_id: Option<String>,
}

impl Default for SmartNightBoost {
    fn default() -> Self {
        Self {
            enabled: false,
            target_time: ClockTime::from_hm(6, 0).unwrap_or(ClockTime::MIDNIGHT),
            weather_source_id: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_target() -> f32 {
    20.0
}

fn default_home_preset() -> PresetMode {
    PresetMode::Home
}

fn default_away_preset() -> PresetMode {
    PresetMode::Away
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "default_target", alias = "target_temperature")]
    pub base_target_temperature: f32,
    #[serde(default)]
    pub current_temperature: Option<f32>,
    #[serde(default)]
    pub hvac_mode: HvacMode,
    #[serde(default)]
    pub manual_override: bool,
    #[serde(default)]
    pub preset_mode: PresetMode,
    #[serde(flatten)]
    pub presets: ZonePresets,
    #[serde(default)]
    pub boost: BoostState,
    #[serde(default)]
    pub night_boost: NightBoost,
    #[serde(default)]
    pub smart_night_boost: SmartNightBoost,
    #[serde(default)]
    pub hysteresis_override: Option<f32>,
    #[serde(default = "default_true")]
    pub shutdown_switches_when_idle: bool,
    #[serde(default, deserialize_with = "window_sensors")]
    pub window_sensors: Vec<WindowSensor>,
    #[serde(default, deserialize_with = "presence_sensors")]
    pub presence_sensors: Vec<PresenceSensor>,
    #[serde(default)]
    pub use_global_presence: bool,
    #[serde(default)]
    pub auto_preset_enabled: bool,
    #[serde(default = "default_home_preset")]
    pub auto_preset_home: PresetMode,
    #[serde(default = "default_away_preset")]
    pub auto_preset_away: PresetMode,
    #[serde(default)]
    pub primary_temperature_sensor: Option<String>,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceEntry>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}

impl Zone {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            hidden: false,
            base_target_temperature: default_target(),
            current_temperature: None,
            hvac_mode: HvacMode::Heat,
            manual_override: false,
            preset_mode: PresetMode::None,
            presets: ZonePresets::default(),
            boost: BoostState::default(),
            night_boost: NightBoost::default(),
            smart_night_boost: SmartNightBoost::default(),
            hysteresis_override: None,
            shutdown_switches_when_idle: true,
            window_sensors: Vec::new(),
            presence_sensors: Vec::new(),
            use_global_presence: false,
            auto_preset_enabled: false,
            auto_preset_home: PresetMode::Home,
            auto_preset_away: PresetMode::Away,
            primary_temperature_sensor: None,
            devices: BTreeMap::new(),
            schedules: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|err| HeatingError::Persistence(err.to_string()))
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|err| HeatingError::Persistence(err.to_string()))
    }

    pub fn hysteresis(&self, settings: &GlobalSettings) -> f32 {
        self.hysteresis_override.unwrap_or(settings.hysteresis)
    }

    /// Temperature a preset resolves to in this zone; `None` for `PresetMode::None`.
    pub fn preset_temperature(&self, preset: PresetMode, settings: &GlobalSettings) -> Option<f32> {
        if preset == PresetMode::Boost {
            return Some(self.boost.temperature);
        }
        let (local, use_global) = self.presets.slot(preset)?;
        if use_global {
            settings.presets.get(preset)
        } else {
            Some(local)
        }
    }

    pub fn is_boost_active(&self, now: DateTime<Utc>) -> bool {
        self.boost.active && self.boost.end_time.map(|end| now < end).unwrap_or(false)
    }

    pub fn boost_remaining_minutes(&self, now: DateTime<Utc>) -> i64 {
        match self.boost.end_time {
            Some(end) if self.boost.active => (end - now).num_minutes().max(0),
            _ => 0,
        }
    }

    pub fn set_boost(&mut self, temperature: f32, duration_minutes: u32, now: DateTime<Utc>) {
        self.boost = BoostState {
            active: true,
            duration: duration_minutes,
            temperature,
            end_time: Some(now + Duration::minutes(i64::from(duration_minutes))),
        };
        self.preset_mode = PresetMode::Boost;
    }

    pub fn cancel_boost(&mut self) -> bool {
        let changed = self.boost.active || self.preset_mode == PresetMode::Boost;
        self.boost.active = false;
        self.boost.end_time = None;
        if self.preset_mode == PresetMode::Boost {
            self.preset_mode = PresetMode::None;
        }
        changed
    }

    /// Cancel a boost whose end time has passed. Returns true when it expired.
    pub fn expire_boost(&mut self, now: DateTime<Utc>) -> bool {
        let stale_preset = self.preset_mode == PresetMode::Boost && !self.boost.active;
        if (self.boost.active && !self.is_boost_active(now)) || stale_preset {
            self.cancel_boost();
            return true;
        }
        false
    }

    pub fn devices_of(&self, kind: DeviceKind) -> impl Iterator<Item = (&str, &DeviceEntry)> {
        self.devices
            .iter()
            .filter(move |(_, entry)| entry.kind == kind)
            .map(|(id, entry)| (id.as_str(), entry))
    }

    /// State-store entities of every device of `kind`.
    pub fn entities_of(&self, kind: DeviceKind) -> Vec<String> {
        self.devices_of(kind)
            .map(|(id, entry)| entry.entity(id).to_string())
            .collect()
    }

    pub fn schedule(&self, schedule_id: &str) -> Option<&Schedule> {
        self.schedules
            .iter()
            .find(|schedule| schedule.id == schedule_id)
    }

    pub fn presence_entities<'a>(&'a self, settings: &'a GlobalSettings) -> Vec<&'a str> {
        if self.use_global_presence {
            settings
                .global_presence_sensors
                .iter()
                .map(String::as_str)
                .collect()
        } else {
            self.presence_sensors
                .iter()
                .map(|sensor| sensor.sensor_id.as_str())
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{DayOfWeek, ScheduleTarget};
    use pretty_assertions::assert_eq;

    fn populated_zone() -> Zone {
        let mut zone = Zone::new("living", "Living Room");
        zone.base_target_temperature = 21.5;
        zone.current_temperature = Some(19.25);
        zone.preset_mode = PresetMode::Eco;
        zone.presets.set_local(PresetMode::Sleep, 17.0).unwrap();
        zone.boost = BoostState {
            active: true,
            duration: 45,
            temperature: 24.0,
            end_time: Some(DateTime::from_timestamp(1_767_600_000, 0).unwrap()),
        };
        zone.night_boost.enabled = true;
        zone.smart_night_boost = SmartNightBoost {
            enabled: true,
            target_time: "07:15".parse().unwrap(),
            weather_source_id: Some("weather/home".to_string()),
        };
        zone.hysteresis_override = Some(0.3);
        zone.shutdown_switches_when_idle = false;
        zone.window_sensors = vec![WindowSensor {
            sensor_id: "window/living".to_string(),
            action: WindowAction::ReduceTemperature,
            temp_drop: 3.0,
        }];
        zone.presence_sensors = vec![PresenceSensor {
            sensor_id: "person/alex".to_string(),
        }];
        zone.auto_preset_enabled = true;
        zone.primary_temperature_sensor = Some("sensor/living".to_string());
        zone.devices.insert(
            "trv-1".to_string(),
            DeviceEntry {
                kind: DeviceKind::Valve,
                source_topic: "z2m/trv-1".to_string(),
            },
        );
        zone.devices
            .insert("pump".to_string(), DeviceEntry::new(DeviceKind::Switch));
        zone.schedules.push(Schedule::recurring(
            "weekday-morning",
            vec![DayOfWeek::Mon, DayOfWeek::Fri],
            "06:00".parse().unwrap(),
            "08:30".parse().unwrap(),
            ScheduleTarget::Temperature { temperature: 21.0 },
        ));
        zone
    }

    #[test]
    fn json_round_trip_preserves_every_field() {
        let zone = populated_zone();
        let restored = Zone::from_json(zone.to_json().unwrap()).unwrap();
        assert_eq!(restored, zone);
    }

    #[test]
    fn legacy_sensor_lists_are_upgraded() {
        let legacy = serde_json::json!({
            "id": "bedroom",
            "name": "Bedroom",
            "target_temperature": 19.0,
            "window_sensors": ["binary_sensor.bedroom_window"],
            "presence_sensors": ["person.sam"],
        });

        let zone = Zone::from_json(legacy).unwrap();
        assert_eq!(zone.base_target_temperature, 19.0);
        assert_eq!(
            zone.window_sensors,
            vec![WindowSensor::new("binary_sensor.bedroom_window")]
        );
        assert_eq!(zone.presence_sensors[0].sensor_id, "person.sam");

        let upgraded = Zone::from_json(zone.to_json().unwrap()).unwrap();
        assert_eq!(upgraded, zone);
        assert_eq!(
            zone.to_json().unwrap()["window_sensors"][0]["action"],
            "turn_off"
        );
    }

    #[test]
    fn preset_resolution_honours_global_flags() {
        let settings = GlobalSettings::default();
        let mut zone = Zone::new("z", "Z");

        assert_eq!(
            zone.preset_temperature(PresetMode::Comfort, &settings),
            Some(22.0)
        );
        zone.presets.set_local(PresetMode::Comfort, 23.5).unwrap();
        assert_eq!(
            zone.preset_temperature(PresetMode::Comfort, &settings),
            Some(23.5)
        );
        assert_eq!(zone.preset_temperature(PresetMode::None, &settings), None);
        assert!(zone.presets.set_local(PresetMode::Boost, 30.0).is_err());
    }

    #[test]
    fn boost_expires_exactly_at_end() {
        let start = DateTime::from_timestamp(1_767_600_000, 0).unwrap();
        let mut zone = Zone::new("z", "Z");
        zone.set_boost(25.0, 30, start);

        let just_before = start + Duration::minutes(30) - Duration::seconds(1);
        assert!(zone.is_boost_active(just_before));
        assert!(!zone.expire_boost(just_before));
        assert_eq!(zone.preset_mode, PresetMode::Boost);

        let end = start + Duration::minutes(30);
        assert!(!zone.is_boost_active(end));
        assert!(zone.expire_boost(end));
        assert!(!zone.boost.active);
        assert_eq!(zone.preset_mode, PresetMode::None);
    }

    #[test]
    fn night_boost_window_crossing_midnight() {
        let boost = NightBoost {
            enabled: true,
            offset: 1.0,
            start_time: "22:00".parse().unwrap(),
            end_time: "06:00".parse().unwrap(),
        };
        assert!(boost.is_active_at("23:30".parse().unwrap()));
        assert!(boost.is_active_at("00:00".parse().unwrap()));
        assert!(boost.is_active_at("05:59".parse().unwrap()));
        assert!(!boost.is_active_at("06:00".parse().unwrap()));
        assert!(!boost.is_active_at("12:00".parse().unwrap()));
    }

    #[test]
    fn device_entity_falls_back_to_id() {
        let zone = populated_zone();
        assert_eq!(zone.entities_of(DeviceKind::Valve), vec!["z2m/trv-1"]);
        assert_eq!(zone.entities_of(DeviceKind::Switch), vec!["pump"]);
        assert!(zone.entities_of(DeviceKind::Thermostat).is_empty());
    }
}
